/// State machines for the rule-grammar subsystem: states, edges, and the
/// backtracking matcher with resumable partial-match search.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::automata::compiler::RuleSet;

pub const START_STATE: &str = "START";
pub const FINAL_STATE: &str = "FINAL";

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("machine `{machine}` has an edge into unknown state `{state}`")]
    UnknownState { machine: String, state: String },
    #[error("state `{0}` calls a sub-automaton but none is wired to it")]
    UnknownAutomaton(String),
}

/// A transition: matching consumes the literal input, one character for a
/// character class, or nothing for an epsilon edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub input: String,
    pub dest: String,
    pub is_character_class: bool,
}

impl Edge {
    pub fn new(input: impl Into<String>, dest: impl Into<String>) -> Edge {
        Edge {
            input: input.into(),
            dest: dest.into(),
            is_character_class: false,
        }
    }

    /// A character-class edge (`CHAR`, `ALPHA`, `DIGIT`).
    pub fn class(name: impl Into<String>, dest: impl Into<String>) -> Edge {
        Edge {
            input: name.into(),
            dest: dest.into(),
            is_character_class: true,
        }
    }

    /// A zero-width transition.
    pub fn epsilon(dest: impl Into<String>) -> Edge {
        Edge::new("", dest)
    }
}

/// A named state and its outgoing edges. `is_automata` marks a state that
/// stands for a call into another rule's machine.
#[derive(Debug, Clone)]
pub struct State {
    pub id: String,
    pub edges: Vec<Edge>,
    pub is_automata: bool,
}

impl State {
    pub fn new(id: impl Into<String>) -> State {
        State {
            id: id.into(),
            edges: Vec::new(),
            is_automata: false,
        }
    }

    pub fn with_edges(id: impl Into<String>, edges: Vec<Edge>) -> State {
        State {
            id: id.into(),
            edges,
            is_automata: false,
        }
    }

    pub fn automata(id: impl Into<String>) -> State {
        State {
            id: id.into(),
            edges: Vec::new(),
            is_automata: true,
        }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }
}

/// One step of an accepting path. `start` is inclusive, `end` exclusive;
/// sub-automaton calls carry their own nested path.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub automata_id: String,
    pub state_id: String,
    pub start: usize,
    pub end: usize,
    pub nested: Option<Vec<StateRecord>>,
}

/// A compiled rule machine: one START, one FINAL, and a map of states.
/// Ids ending in `_N` or `_#N` are reserved for compiler-generated copies.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub id: String,
    states: FxHashMap<String, State>,
    automata_targets: FxHashMap<String, String>,
}

impl StateMachine {
    pub fn new(id: impl Into<String>) -> StateMachine {
        StateMachine {
            id: id.into(),
            states: FxHashMap::default(),
            automata_targets: FxHashMap::default(),
        }
    }

    pub fn with_states(id: impl Into<String>, states: Vec<State>) -> StateMachine {
        let mut machine = StateMachine::new(id);
        for state in states {
            machine.add_state(state);
        }
        machine
    }

    pub fn add_state(&mut self, state: State) {
        assert!(
            !self.states.contains_key(&state.id),
            "machine `{}` already has a state `{}`",
            self.id,
            state.id
        );
        self.states.insert(state.id.clone(), state);
    }

    pub fn add_edge(&mut self, state_id: &str, edge: Edge) {
        let state = self
            .states
            .get_mut(state_id)
            .unwrap_or_else(|| panic!("machine `{}` has no state `{}`", self.id, state_id));
        state.add_edge(edge);
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.get(id)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// The rule a sub-automaton state was wired to during linking.
    pub fn automata_target(&self, state_id: &str) -> Option<&str> {
        self.automata_targets.get(state_id).map(String::as_str)
    }

    pub(crate) fn set_automata_target(&mut self, state_id: String, rule: String) {
        self.automata_targets.insert(state_id, rule);
    }

    /// Whole-input acceptance with a throwaway search context. For
    /// repeated or partial matching build a `Matcher` and reuse it.
    pub fn accepts(&self, input: &str) -> Result<bool, MatchError> {
        Matcher::new(self).accepts(input)
    }
}

type Alternative = (String, usize, Vec<StateRecord>);

#[derive(Default)]
struct SearchFrontier {
    alternatives: Vec<Alternative>,
    visited: FxHashSet<(String, usize)>,
    started: bool,
}

/// A search context over one machine (plus the rule set its sub-automata
/// live in). All mutable search state lives here, so independent searches
/// use independent matchers — or an explicit `reset()`.
///
/// Frontiers are memoized per start offset: calling `accepts_partial` again
/// with the same start enumerates the next accepting prefix.
pub struct Matcher<'a> {
    root: &'a StateMachine,
    rules: Option<&'a RuleSet>,
    searches: FxHashMap<(String, usize), SearchFrontier>,
}

impl<'a> Matcher<'a> {
    /// A matcher over a standalone machine; sub-automaton states error.
    pub fn new(machine: &'a StateMachine) -> Matcher<'a> {
        Matcher {
            root: machine,
            rules: None,
            searches: FxHashMap::default(),
        }
    }

    /// A matcher that resolves sub-automaton states against `rules`.
    pub fn with_rules(machine: &'a StateMachine, rules: &'a RuleSet) -> Matcher<'a> {
        Matcher {
            root: machine,
            rules: Some(rules),
            searches: FxHashMap::default(),
        }
    }

    /// Drop every memoized frontier. Required between logically
    /// independent searches over the same matcher.
    pub fn reset(&mut self) {
        self.searches.clear();
    }

    /// Does the machine accept the entire input?
    pub fn accepts(&mut self, input: &str) -> Result<bool, MatchError> {
        Ok(self
            .search(self.root.id.clone(), input, 0, false)?
            .is_some())
    }

    /// Find the next accepting prefix from `start`. Re-calling with the
    /// same start continues the same search and yields successive matches
    /// until exhaustion.
    pub fn accepts_partial(
        &mut self,
        input: &str,
        start: usize,
    ) -> Result<Option<(Vec<StateRecord>, usize)>, MatchError> {
        self.search(self.root.id.clone(), input, start, true)
    }

    fn search(
        &mut self,
        machine_id: String,
        input: &str,
        start: usize,
        partial: bool,
    ) -> Result<Option<(Vec<StateRecord>, usize)>, MatchError> {
        let key = (machine_id.clone(), start);
        {
            let frontier = self.searches.entry(key.clone()).or_default();
            if !frontier.started {
                frontier.started = true;
                frontier
                    .alternatives
                    .push((START_STATE.to_string(), start, Vec::new()));
            }
        }

        loop {
            let popped = self
                .searches
                .get_mut(&key)
                .expect("frontier created above")
                .alternatives
                .pop();
            let Some((state_id, mut pos, mut path)) = popped else {
                return Ok(None);
            };
            self.searches
                .get_mut(&key)
                .expect("frontier created above")
                .visited
                .insert((state_id.clone(), pos));

            let (is_automata, target, edges) = {
                let machine = self.resolve(&machine_id)?;
                let state = machine.state(&state_id).ok_or_else(|| MatchError::UnknownState {
                    machine: machine_id.clone(),
                    state: state_id.clone(),
                })?;
                (
                    state.is_automata,
                    machine.automata_target(&state_id).map(String::from),
                    state.edges.clone(),
                )
            };

            if is_automata {
                let target = target.ok_or_else(|| MatchError::UnknownAutomaton(state_id.clone()))?;
                match self.search(target, input, pos, true)? {
                    Some((nested, match_end)) => {
                        path.push(StateRecord {
                            automata_id: machine_id.clone(),
                            state_id: format!("{}_internal", state_id),
                            start: pos,
                            end: match_end,
                            nested: Some(nested),
                        });
                        // The sub-automaton may accept a longer prefix next
                        // time, so the same state goes back on the stack at
                        // the new position.
                        self.searches
                            .get_mut(&key)
                            .expect("frontier created above")
                            .alternatives
                            .push((state_id.clone(), match_end, path.clone()));
                        pos = match_end;
                    }
                    None => continue,
                }
            }

            for edge in &edges {
                let Some(consumed) = edge_match_len(input, pos, edge) else {
                    continue;
                };
                let next_pos = pos + consumed;
                let mut next_path = path.clone();
                next_path.push(StateRecord {
                    automata_id: machine_id.clone(),
                    state_id: state_id.clone(),
                    start: pos,
                    end: next_pos,
                    nested: None,
                });
                let frontier = self
                    .searches
                    .get_mut(&key)
                    .expect("frontier created above");
                if !frontier.visited.contains(&(edge.dest.clone(), next_pos)) {
                    frontier
                        .alternatives
                        .push((edge.dest.clone(), next_pos, next_path));
                }
            }

            if state_id == FINAL_STATE && (partial || pos == input.len()) {
                return Ok(Some((path, pos)));
            }
        }
    }

    fn resolve(&self, id: &str) -> Result<&StateMachine, MatchError> {
        if id == self.root.id {
            return Ok(self.root);
        }
        self.rules
            .and_then(|rules| rules.get(id))
            .ok_or_else(|| MatchError::UnknownAutomaton(id.to_string()))
    }
}

fn edge_match_len(input: &str, pos: usize, edge: &Edge) -> Option<usize> {
    if edge.input.is_empty() {
        return Some(0);
    }
    if edge.is_character_class {
        let c = input[pos..].chars().next()?;
        return character_in_class(&edge.input, c).then(|| c.len_utf8());
    }
    input[pos..]
        .starts_with(edge.input.as_str())
        .then(|| edge.input.len())
}

fn character_in_class(class: &str, c: char) -> bool {
    match class {
        "CHAR" => true,
        "ALPHA" => c.is_ascii_alphabetic(),
        "DIGIT" => c.is_ascii_digit(),
        _ => false,
    }
}
