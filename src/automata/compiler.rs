/// Rule-grammar compiler: lowers tokenized rule bodies to state machines
/// and wires sub-automaton references across the rule set.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashMap;
use thiserror::Error;

use crate::automata::machine::{
    Edge, Matcher, State, StateMachine, FINAL_STATE, START_STATE,
};
use crate::automata::splitter::{self, SplitError, Token};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("rule `{0}` has an empty body")]
    EmptyRule(String),
    #[error("rule line `{0}` is missing `=`")]
    MissingEquals(String),
    #[error("alternation `/` with a missing branch")]
    DanglingAlternation,
    #[error("bad repetition prefix `{0}`")]
    BadRepetition(String),
    #[error("rule `{rule}` references undefined rule `{target}`")]
    UnresolvedReference { rule: String, target: String },
}

/// All machines compiled from one rule-grammar source, linked together.
#[derive(Debug, Default)]
pub struct RuleSet {
    machines: HashMap<String, StateMachine>,
}

impl RuleSet {
    /// Compile a rule-grammar document: one `rulename = elements` per
    /// line, `;` comments, blank lines ignored. Pass one builds a machine
    /// per rule; pass two wires every sub-automaton state to its target
    /// rule by stripped base name, rejecting unresolved references here
    /// rather than at match time.
    pub fn compile(source: &str) -> Result<RuleSet, CompileError> {
        let mut machines = HashMap::new();
        for raw_line in source.lines() {
            let line = raw_line.split(';').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (name, body) = line
                .split_once('=')
                .ok_or_else(|| CompileError::MissingEquals(line.to_string()))?;
            let name = name.trim();
            let machine = compile_rule(name, body)?;
            machines.insert(name.to_string(), machine);
        }

        let mut rules = RuleSet { machines };
        rules.link()?;
        Ok(rules)
    }

    pub fn get(&self, name: &str) -> Option<&StateMachine> {
        self.machines.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// A matcher for one rule, resolving sub-automata across this set.
    pub fn matcher(&self, rule: &str) -> Option<Matcher<'_>> {
        self.get(rule).map(|machine| Matcher::with_rules(machine, self))
    }

    fn link(&mut self) -> Result<(), CompileError> {
        let names: FxHashSet<String> = self.machines.keys().cloned().collect();
        for (rule_name, machine) in self.machines.iter_mut() {
            let automata_states: Vec<(String, String)> = machine
                .states()
                .filter(|state| state.is_automata)
                .map(|state| (state.id.clone(), base_rule_name(&state.id).to_string()))
                .collect();
            for (state_id, base) in automata_states {
                if !names.contains(&base) {
                    return Err(CompileError::UnresolvedReference {
                        rule: rule_name.clone(),
                        target: base,
                    });
                }
                machine.set_automata_target(state_id, base);
            }
        }
        Ok(())
    }
}

/// Compile a single rule body into an unlinked machine.
pub fn compile_rule(name: &str, body: &str) -> Result<StateMachine, CompileError> {
    let tokens = splitter::split_into_tokens(body)?;
    if tokens.is_empty() {
        return Err(CompileError::EmptyRule(name.to_string()));
    }
    let mut used_ids = FxHashMap::default();
    let fragment = build_fragment(&tokens, &mut used_ids)?;

    let mut machine = StateMachine::new(name);
    machine.add_state(State::new(START_STATE));
    for state in fragment.states {
        machine.add_state(state);
    }
    machine.add_state(State::new(FINAL_STATE));
    for edge in fragment.start_edges {
        machine.add_edge(START_STATE, edge);
    }
    for end in fragment.end_states {
        machine.add_edge(&end, Edge::epsilon(FINAL_STATE));
    }
    Ok(machine)
}

/// A partially built graph: the edges that enter it, the states it owns,
/// and the frontier of states its successors attach to.
struct Fragment {
    start_edges: Vec<Edge>,
    end_states: Vec<String>,
    states: Vec<State>,
}

fn build_fragment(
    tokens: &[Token],
    used_ids: &mut FxHashMap<String, u32>,
) -> Result<Fragment, CompileError> {
    let mut start_edges: Vec<Edge> = Vec::new();
    let mut states: Vec<State> = Vec::new();
    let mut frontier: Vec<String> = Vec::new();
    let mut first_batch = true;

    let mut idx = 0;
    while idx < tokens.len() {
        // Gather the alternation batch: token (/ token)*.
        if tokens[idx] == Token::Alt {
            return Err(CompileError::DanglingAlternation);
        }
        let mut batch = vec![&tokens[idx]];
        let mut next = idx + 1;
        while next < tokens.len() && tokens[next] == Token::Alt {
            let target = tokens
                .get(next + 1)
                .ok_or(CompileError::DanglingAlternation)?;
            batch.push(target);
            next += 2;
        }

        let mut next_frontier: Vec<String> = Vec::new();
        for token in batch {
            let (repetition, optional, core) = peel(token)?;
            let base = match core {
                Token::Atom(raw) => atom_fragment(raw, used_ids),
                Token::Group(inner) | Token::Optional(inner) => {
                    build_fragment(inner, used_ids)?
                }
                Token::Alt => return Err(CompileError::DanglingAlternation),
                Token::Repeat(prefix, _) => {
                    return Err(CompileError::BadRepetition(prefix.clone()))
                }
            };
            let fragment = apply_repetition(base, repetition, optional);

            if first_batch {
                start_edges.extend(fragment.start_edges);
            } else {
                for end_id in &frontier {
                    for edge in &fragment.start_edges {
                        state_mut(&mut states, end_id).add_edge(edge.clone());
                    }
                }
            }
            states.extend(fragment.states);
            next_frontier.extend(fragment.end_states);
        }

        first_batch = false;
        frontier = next_frontier;
        idx = next;
    }

    Ok(Fragment {
        start_edges,
        end_states: frontier,
        states,
    })
}

type Repetition = (u64, Option<u64>);

/// Separate a token into its repetition, optionality, and core.
/// Optionality wins over an explicit repetition, as 0–1 repetition.
fn peel(token: &Token) -> Result<(Option<Repetition>, bool, &Token), CompileError> {
    match token {
        Token::Repeat(prefix, inner) => {
            let repetition = parse_repetition(prefix)?;
            match inner.as_ref() {
                Token::Optional(_) => Ok((None, true, inner.as_ref())),
                core => Ok((Some(repetition), false, core)),
            }
        }
        Token::Optional(_) => Ok((None, true, token)),
        other => Ok((None, false, other)),
    }
}

fn parse_repetition(prefix: &str) -> Result<Repetition, CompileError> {
    let bad = || CompileError::BadRepetition(prefix.to_string());
    match prefix.split_once('*') {
        None => {
            let n: u64 = prefix.parse().map_err(|_| bad())?;
            if n == 0 {
                return Err(bad());
            }
            Ok((n, Some(n)))
        }
        Some((min_part, max_part)) => {
            if min_part.contains('*') || max_part.contains('*') {
                return Err(bad());
            }
            let min = if min_part.is_empty() {
                0
            } else {
                min_part.parse().map_err(|_| bad())?
            };
            let max = if max_part.is_empty() {
                None
            } else {
                let m: u64 = max_part.parse().map_err(|_| bad())?;
                if m == 0 || m < min {
                    return Err(bad());
                }
                Some(m)
            };
            Ok((min, max))
        }
    }
}

/// A single-state fragment for one atom. Quoted atoms match their literal;
/// `CHAR`/`ALPHA`/`DIGIT` match one character of the class; any other bare
/// identifier becomes a sub-automaton call entered by an epsilon edge.
fn atom_fragment(raw: &str, used_ids: &mut FxHashMap<String, u32>) -> Fragment {
    let (label, is_class, is_automata, base_id) = match dequote(raw) {
        Some(literal) => (literal.to_string(), false, false, literal.to_string()),
        None if matches!(raw, "CHAR" | "ALPHA" | "DIGIT") => {
            (raw.to_string(), true, false, raw.to_string())
        }
        None => (String::new(), false, true, raw.to_string()),
    };

    let count = used_ids.entry(base_id.clone()).or_insert(0);
    *count += 1;
    let id = if *count == 1 {
        base_id
    } else {
        format!("{}_#{}", base_id, *count)
    };

    let mut state = State::new(id.clone());
    state.is_automata = is_automata;
    let edge = Edge {
        input: label,
        dest: id.clone(),
        is_character_class: is_class,
    };

    Fragment {
        start_edges: vec![edge],
        end_states: vec![id],
        states: vec![state],
    }
}

/// Lower a repetition onto a fragment: clone it `max` times (`min` times
/// with a self-loop when unbounded), link each copy's ends to the next
/// copy, and add epsilon skip edges from every copy ≥ `min` to the final
/// copy's ends. Optionality is the 0–1 case.
fn apply_repetition(fragment: Fragment, repetition: Option<Repetition>, optional: bool) -> Fragment {
    let (min, max) = match (optional, repetition) {
        (true, _) => (0, Some(1)),
        (false, None) => return fragment,
        (false, Some(r)) => r,
    };
    if (min, max) == (1, Some(1)) {
        return fragment;
    }

    let end_ids: FxHashSet<String> = fragment.end_states.iter().cloned().collect();
    let total_copies = match max {
        None => min.max(1),
        Some(m) => m,
    } as usize;

    let mut states: Vec<State> = fragment.states.clone();
    let mut in_edges: Vec<Edge> = fragment.start_edges.clone();
    let mut current_ends: Vec<String> = fragment.end_states.clone();
    let mut last_suffix = String::new();

    for copy in 2..=total_copies {
        let suffix = format!("_{}", copy);

        // Link the previous copy's ends into this copy.
        for edge in &fragment.start_edges {
            for end_id in &current_ends {
                let mut link = edge.clone();
                link.dest.push_str(&suffix);
                state_mut(&mut states, end_id).add_edge(link);
            }
        }

        let mut new_ends = Vec::new();
        for original in &fragment.states {
            let mut cloned = State::new(format!("{}{}", original.id, suffix));
            cloned.is_automata = original.is_automata;
            for edge in &original.edges {
                let mut internal = edge.clone();
                internal.dest.push_str(&suffix);
                cloned.edges.push(internal);
            }
            if end_ids.contains(&original.id) {
                new_ends.push(cloned.id.clone());
            }
            states.push(cloned);
        }
        current_ends = new_ends;
        last_suffix = suffix;
    }

    if max.is_none() {
        // Unbounded: the last copy loops on itself; a zero minimum can
        // bypass the whole fragment.
        let mut entry_skips = Vec::new();
        for end_id in &current_ends {
            for edge in &fragment.start_edges {
                let mut loop_edge = edge.clone();
                loop_edge.dest.push_str(&last_suffix);
                state_mut(&mut states, end_id).add_edge(loop_edge);
            }
            if min == 0 {
                entry_skips.push(Edge::epsilon(end_id.clone()));
            }
        }
        in_edges.extend(entry_skips);
    } else {
        let last = total_copies as u64;
        let skip_targets: Vec<String> = current_ends.clone();
        for copy in min..last {
            if copy == 0 {
                for target in &skip_targets {
                    in_edges.push(Edge::epsilon(target.clone()));
                }
                continue;
            }
            let suffix = if copy == 1 {
                String::new()
            } else {
                format!("_{}", copy)
            };
            let copy_ends: FxHashSet<String> = fragment
                .end_states
                .iter()
                .map(|id| format!("{}{}", id, suffix))
                .collect();
            for state in states.iter_mut() {
                if copy_ends.contains(&state.id) {
                    for target in &skip_targets {
                        state.add_edge(Edge::epsilon(target.clone()));
                    }
                }
            }
        }
    }

    Fragment {
        start_edges: in_edges,
        end_states: current_ends,
        states,
    }
}

fn state_mut<'a>(states: &'a mut [State], id: &str) -> &'a mut State {
    states
        .iter_mut()
        .find(|state| state.id == id)
        .expect("fragment frontier always names fragment states")
}

fn dequote(raw: &str) -> Option<&str> {
    raw.strip_prefix('"')?.strip_suffix('"')
}

/// Strip compiler-generated `_N` and `_#N` suffixes back to the rule name.
fn base_rule_name(id: &str) -> &str {
    let mut base = id;
    loop {
        let Some(pos) = base.rfind('_') else {
            return base;
        };
        let suffix = &base[pos + 1..];
        let digits = suffix.strip_prefix('#').unwrap_or(suffix);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            base = &base[..pos];
        } else {
            return base;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_repetition_compiles_to_a_chain() {
        let machine = compile_rule("r", "abc 2\"def\"").unwrap();
        // START, abc, def, def_2, FINAL
        assert_eq!(machine.state_count(), 5);

        let start = machine.state(START_STATE).unwrap();
        assert_eq!(start.edges.len(), 1);
        assert_eq!(start.edges[0].input, "");
        assert_eq!(start.edges[0].dest, "abc");
        assert!(machine.state("abc").unwrap().is_automata);

        let abc = machine.state("abc").unwrap();
        assert_eq!(abc.edges.len(), 1);
        assert_eq!(abc.edges[0].input, "def");
        assert_eq!(abc.edges[0].dest, "def");

        let def = machine.state("def").unwrap();
        assert_eq!(def.edges.len(), 1, "no skip edges on an exact repetition");
        assert_eq!(def.edges[0].input, "def");
        assert_eq!(def.edges[0].dest, "def_2");

        let def_2 = machine.state("def_2").unwrap();
        assert_eq!(def_2.edges.len(), 1);
        assert_eq!(def_2.edges[0].input, "");
        assert_eq!(def_2.edges[0].dest, FINAL_STATE);
    }

    #[test]
    fn unbounded_repetition_self_loops_and_skips() {
        let machine = compile_rule("r", "abc *\"def\"").unwrap();
        // START, abc, def, FINAL
        assert_eq!(machine.state_count(), 4);

        let abc = machine.state("abc").unwrap();
        assert!(abc
            .edges
            .iter()
            .any(|e| e.input == "def" && e.dest == "def"));
        assert!(
            abc.edges.iter().any(|e| e.input.is_empty() && e.dest == "def"),
            "a zero-minimum repetition can be skipped entirely"
        );

        let def = machine.state("def").unwrap();
        assert!(
            def.edges.iter().any(|e| e.input == "def" && e.dest == "def"),
            "the last copy loops on itself"
        );
        assert!(def
            .edges
            .iter()
            .any(|e| e.input.is_empty() && e.dest == FINAL_STATE));
    }

    #[test]
    fn bounded_repetition_accepts_the_window() {
        let machine = compile_rule("r", "2*4\"a\"").unwrap();
        assert!(!machine.accepts("a").unwrap());
        assert!(machine.accepts("aa").unwrap());
        assert!(machine.accepts("aaa").unwrap());
        assert!(machine.accepts("aaaa").unwrap());
        assert!(!machine.accepts("aaaaa").unwrap());
    }

    #[test]
    fn repeated_alternation_group() {
        let machine = compile_rule("r", "5(\"a\"/\"bc\"/\"def\")").unwrap();
        assert!(machine.accepts("abcdefabc").unwrap());
        assert!(machine.accepts("aaaaa").unwrap());
        assert!(!machine.accepts("aaaa").unwrap());
        assert!(!machine.accepts("").unwrap());
    }

    #[test]
    fn optional_group_is_zero_or_one() {
        let machine = compile_rule("r", "\"a\" [\"b\"]").unwrap();
        assert!(machine.accepts("a").unwrap());
        assert!(machine.accepts("ab").unwrap());
        assert!(!machine.accepts("b").unwrap());
        assert!(!machine.accepts("abb").unwrap());
    }

    #[test]
    fn top_level_alternation() {
        let machine = compile_rule("r", "\"cat\" / \"dog\"").unwrap();
        assert!(machine.accepts("cat").unwrap());
        assert!(machine.accepts("dog").unwrap());
        assert!(!machine.accepts("catdog").unwrap());
    }

    #[test]
    fn character_class_rule() {
        let machine = compile_rule("r", "1*DIGIT").unwrap();
        assert!(machine.accepts("7").unwrap());
        assert!(machine.accepts("123").unwrap());
        assert!(!machine.accepts("12a").unwrap());
        assert!(!machine.accepts("").unwrap());
    }

    #[test]
    fn repeated_identifier_gets_a_collision_suffix() {
        let machine = compile_rule("r", "\"x\" sub \"y\" sub").unwrap();
        assert!(machine.state("sub").is_some());
        assert!(machine.state("sub_#2").is_some());
        assert!(machine.state("sub_#2").unwrap().is_automata);
    }

    #[test]
    fn base_rule_name_strips_generated_suffixes() {
        assert_eq!(base_rule_name("town"), "town");
        assert_eq!(base_rule_name("town_#2"), "town");
        assert_eq!(base_rule_name("town_3"), "town");
        assert_eq!(base_rule_name("town_#2_4"), "town");
        assert_eq!(base_rule_name("snake_case"), "snake_case");
    }

    #[test]
    fn rule_set_links_sub_automata() {
        let source = "\
greeting = \"hello\" / \"hi\"\n\
sentence = greeting \" world\"\n";
        let rules = RuleSet::compile(source).unwrap();
        assert_eq!(rules.len(), 2);
        let mut matcher = rules.matcher("sentence").unwrap();
        assert!(matcher.accepts("hello world").unwrap());
        matcher.reset();
        assert!(matcher.accepts("hi world").unwrap());
        matcher.reset();
        assert!(!matcher.accepts("hey world").unwrap());
    }

    #[test]
    fn sub_automaton_may_match_repeatedly() {
        let source = "\
digits = 1*DIGIT\n\
number = digits\n";
        let rules = RuleSet::compile(source).unwrap();
        let mut matcher = rules.matcher("number").unwrap();
        assert!(matcher.accepts("123").unwrap());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let source = "; a rule file\n\nword = 1*ALPHA ; trailing note\n";
        let rules = RuleSet::compile(source).unwrap();
        assert_eq!(rules.len(), 1);
        let mut matcher = rules.matcher("word").unwrap();
        assert!(matcher.accepts("hello").unwrap());
    }

    #[test]
    fn unresolved_reference_fails_at_link_time() {
        assert!(matches!(
            RuleSet::compile("a = missing\n"),
            Err(CompileError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn missing_equals_is_rejected() {
        assert!(matches!(
            RuleSet::compile("just some words\n"),
            Err(CompileError::MissingEquals(_))
        ));
    }

    #[test]
    fn zero_repetition_is_rejected() {
        assert!(matches!(
            compile_rule("r", "0\"a\""),
            Err(CompileError::BadRepetition(_))
        ));
    }
}
