/// Table Linter — validates choice table documents and, optionally, a
/// rule-grammar file.
///
/// Usage: table_linter <table.txt>... [--rules <rules.txt>]

use rolltable::automata::compiler::RuleSet;
use rolltable::core::table::ChoiceTable;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: table_linter <table.txt>... [--rules <rules.txt>]");
        process::exit(0);
    }

    let mut table_paths: Vec<String> = Vec::new();
    let mut rules_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--rules" && i + 1 < args.len() {
            i += 1;
            rules_path = Some(args[i].clone());
        } else {
            table_paths.push(args[i].clone());
        }
        i += 1;
    }

    let mut errors = 0u32;

    for path in &table_paths {
        match ChoiceTable::load_from_path(Path::new(path)) {
            Ok(table) => {
                let subtables: Vec<&str> = table.subtable_names().collect();
                println!(
                    "OK   {} — `{}`: {} choices, {} roots, {} subtables",
                    path,
                    table.namespace(),
                    table.node_count(),
                    table.roots().len(),
                    subtables.len()
                );
            }
            Err(e) => {
                println!("FAIL {} — {}", path, e);
                errors += 1;
            }
        }
    }

    if let Some(ref path) = rules_path {
        match std::fs::read_to_string(path) {
            Ok(contents) => match RuleSet::compile(&contents) {
                Ok(rules) => {
                    let mut names: Vec<&str> = rules.names().collect();
                    names.sort_unstable();
                    println!("OK   {} — {} rules: {}", path, rules.len(), names.join(", "));
                }
                Err(e) => {
                    println!("FAIL {} — {}", path, e);
                    errors += 1;
                }
            },
            Err(e) => {
                println!("FAIL {} — {}", path, e);
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("{} file(s) failed", errors);
        process::exit(1);
    }
}
