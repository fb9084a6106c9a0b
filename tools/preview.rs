/// Preview — generate text from a choice table document.
///
/// Usage: preview <table.txt> [--count <n>] [--uniqueness <level>]
///                [--seed <n>] [--params <file.ron>] [--state]
///
/// A RON params file holds a `GenParams` value, e.g.
/// `(count: 5, uniqueness_level: -1)`; it replaces the flag values.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rolltable::core::generator::GenParams;
use rolltable::core::table::ChoiceTable;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let table_path = args[1].clone();
    let mut params = GenParams::default();
    let mut params_path: Option<String> = None;
    let mut seed: u64 = 42;
    let mut show_state = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--count" if i + 1 < args.len() => {
                i += 1;
                params.count = args[i].parse().unwrap_or(1);
            }
            "--uniqueness" if i + 1 < args.len() => {
                i += 1;
                params.uniqueness_level = args[i].parse().unwrap_or(0);
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().unwrap_or(42);
            }
            "--params" if i + 1 < args.len() => {
                i += 1;
                params_path = Some(args[i].clone());
            }
            "--state" => {
                show_state = true;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    if let Some(ref path) = params_path {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("ERROR reading params {}: {}", path, e);
                process::exit(1);
            }
        };
        params = match ron::from_str(&contents) {
            Ok(params) => params,
            Err(e) => {
                eprintln!("ERROR parsing params {}: {}", path, e);
                process::exit(1);
            }
        };
    }

    let table = match ChoiceTable::load_from_path(Path::new(&table_path)) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("ERROR loading {}: {}", table_path, e);
            process::exit(1);
        }
    };

    let subtables: Vec<&str> = table.subtable_names().collect();
    println!(
        "Loaded `{}` ({} choices, {} subtables)",
        table.namespace(),
        table.node_count(),
        subtables.len()
    );
    println!("Seed: {}\n", seed);

    let mut rng = StdRng::seed_from_u64(seed);
    match table.gen_choices_with_state(&params, &mut rng) {
        Ok((results, state)) => {
            for result in &results {
                println!("{}", result);
            }
            if show_state {
                match ron::ser::to_string_pretty(&state, ron::ser::PrettyConfig::default()) {
                    Ok(rendered) => println!("\nFinal state:\n{}", rendered),
                    Err(e) => eprintln!("ERROR serializing state: {}", e),
                }
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("Preview — generate text from a choice table document.");
    println!();
    println!("Usage: preview <table.txt> [--count <n>] [--uniqueness <level>] [--seed <n>] [--params <file.ron>] [--state]");
    println!();
    println!("  --count <n>          How many strings to generate (default: 1)");
    println!("  --uniqueness <level> 0 = none, N = retire picks at depth N, -1 = retire leaves");
    println!("  --seed <n>           RNG seed (default: 42)");
    println!("  --params <file.ron>  Read a GenParams value from a RON file instead of flags");
    println!("  --state              Also print the final session state");
}
