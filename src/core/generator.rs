/// Choice generation — the recursive expansion engine: weighted slot
/// draws, range and subtable substitution, uniqueness pruning, and the
/// final state-clause sweep.

use rand::Rng;
use rand_distr::{Distribution, Gamma, Normal};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::clause::{self, Clause, ClauseError};
use crate::core::state::{StateMap, Value};
use crate::core::table::{ChoiceId, ChoiceTable};

#[derive(Debug, Error)]
pub enum GenError {
    #[error("no eligible choice with positive weight at level {level}, slot {tag}, template `{template}` ({retired} choices retired)")]
    ExhaustedChoices {
        level: u32,
        tag: u32,
        template: String,
        retired: usize,
    },
    #[error("unknown subtable `{0}`")]
    UnknownSubtable(String),
    #[error("bad range marker: {0}")]
    Range(String),
    #[error(transparent)]
    Clause(#[from] ClauseError),
}

/// How uniqueness constraints consider repeated generations.
///
/// `All` is accepted for forward compatibility but currently behaves as
/// `Each`; the two modes are not yet differentiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Uniqueness {
    #[default]
    Each,
    All,
}

/// Parameters for one `gen_choices` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenParams {
    /// How many strings to generate. State and retired choices carry over
    /// between repetitions on purpose.
    #[serde(default = "default_count")]
    pub count: usize,
    /// 0 = no uniqueness; N > 0 retires nodes picked at recursion depth N;
    /// -1 retires nodes picked as childless leaves.
    #[serde(default)]
    pub uniqueness_level: i32,
    #[serde(default)]
    pub uniqueness_mode: Uniqueness,
}

fn default_count() -> usize {
    1
}

impl Default for GenParams {
    fn default() -> Self {
        GenParams {
            count: 1,
            uniqueness_level: 0,
            uniqueness_mode: Uniqueness::Each,
        }
    }
}

impl ChoiceTable {
    /// Generate `params.count` strings from this table.
    pub fn gen_choices<R: Rng>(
        &self,
        params: &GenParams,
        rng: &mut R,
    ) -> Result<Vec<String>, GenError> {
        self.gen_choices_with_state(params, rng)
            .map(|(results, _)| results)
    }

    /// Generate strings and also return the final session state.
    pub fn gen_choices_with_state<R: Rng>(
        &self,
        params: &GenParams,
        rng: &mut R,
    ) -> Result<(Vec<String>, StateMap), GenError> {
        if params.uniqueness_mode == Uniqueness::All {
            log::debug!("uniqueness mode `all` currently behaves as `each`");
        }
        let mut session = Expansion {
            table: self,
            rng,
            params,
            state: StateMap::default(),
            used: FxHashSet::default(),
            backtrace: Vec::new(),
            level: 1,
        };

        let mut results = Vec::with_capacity(params.count);
        for _ in 0..params.count {
            session.level = 1;
            session.backtrace.clear();
            let generated = session.expand(None, "$")?;
            log::info!("generated: {}", generated);
            results.push(generated);
        }
        Ok((results, session.state))
    }
}

/// One generation session: lives for a single `gen_choices` call and is
/// shared across its repetitions.
struct Expansion<'a, R: Rng> {
    table: &'a ChoiceTable,
    rng: &'a mut R,
    params: &'a GenParams,
    state: StateMap,
    used: FxHashSet<ChoiceId>,
    /// (container, chosen) pairs from the root to the current position;
    /// drives ancestor retirement.
    backtrace: Vec<(Option<ChoiceId>, ChoiceId)>,
    level: u32,
}

impl<R: Rng> Expansion<'_, R> {
    fn expand(&mut self, container: Option<ChoiceId>, template: &str) -> Result<String, GenError> {
        let slots = template.matches('$').count() as u32;
        log::debug!("level {} expanding `{}`", self.level, template);

        // Replacements over the prefix before the first slot (the whole
        // template when there are none).
        let mut text = self.run_replacements(template.to_string(), 0)?;

        for tag in 1..=slots {
            let picked = self.pick(container, tag, template)?;

            if self.params.uniqueness_level > 0
                && self.level == self.params.uniqueness_level as u32
            {
                self.retire(picked);
            }
            if self.params.uniqueness_level == -1 && self.table.children_of(picked).is_empty() {
                self.retire(picked);
            }

            self.backtrace.push((container, picked));
            self.level += 1;
            let child_template = self.table.node(picked).text.clone();
            let expanded = self.expand(Some(picked), &child_template)?;
            self.level -= 1;
            self.backtrace.pop();

            // `$[i]` lets authors override the splice order, so a
            // state-determining slot can be written after the slots that
            // depend on it.
            let explicit = format!("$[{}]", tag);
            let Some((marker_pos, marker_len)) = find_marker(&text, &explicit) else {
                break;
            };

            // The remainder between this slot and the next sees the state
            // the recursion just wrote.
            text = self.run_replacements(text, marker_pos + marker_len)?;

            // A deleted brace group can swallow the marker itself, so it is
            // located again before splicing.
            if let Some((pos, len)) = find_marker(&text, &explicit) {
                text.replace_range(pos..pos + len, &expanded);
            }
        }

        self.extract_state(text)
    }

    /// The three-stage replacement pass over one segment: interpolation,
    /// then range markers, then subtable calls. Each stage scans from
    /// `from` up to the next slot marker.
    fn run_replacements(&mut self, text: String, from: usize) -> Result<String, GenError> {
        let text = self.interpolate_segment(text, from)?;
        let text = self.replace_ranges(text, from)?;
        self.make_subtable_calls(text, from)
    }

    fn interpolate_segment(&mut self, mut text: String, from: usize) -> Result<String, GenError> {
        let mut search = from;
        loop {
            let seg_end = next_slot_pos(&text, from);
            if search >= seg_end {
                break;
            }
            let Some(rel) = text[search..seg_end].find('%') else {
                break;
            };
            let p = search + rel;
            let Some(qrel) = text[p + 1..seg_end].find('%') else {
                break;
            };
            let q = p + 1 + qrel;

            // A span hugging `]` belongs to the range pass.
            if p > 0 && text.as_bytes()[p - 1] == b']' {
                search = q + 1;
                continue;
            }
            // A state-modification clause waits for the final sweep.
            if p > 0 && text.as_bytes()[p - 1] == b' ' {
                if let Ok(Clause::StateMod { .. } | Clause::ConditionalStateMod { .. }) =
                    clause::parse(&text[p - 1..=q])
                {
                    search = q + 1;
                    continue;
                }
            }

            let raw = text[p..=q].to_string();
            match clause::parse(&raw) {
                Ok(Clause::Interpolation { .. }) => {
                    match clause::evaluate_state_interpolation(&raw, &self.state)? {
                        Some(value) => {
                            text.replace_range(p..=q, &value.to_string());
                            if let Some(stripped) = remove_enclosing_braces(&text, p) {
                                text = stripped;
                            }
                        }
                        None => {
                            text = match remove_brace_group(&text, p) {
                                Some(t) => t,
                                None => {
                                    log::info!(
                                        "no value for `{}` and no enclosing braces; removing the clause alone",
                                        raw
                                    );
                                    let mut t = text;
                                    t.replace_range(p..=q, "");
                                    t
                                }
                            };
                        }
                    }
                    search = from;
                }
                _ => search = q + 1,
            }
        }
        Ok(text)
    }

    fn replace_ranges(&mut self, mut text: String, from: usize) -> Result<String, GenError> {
        let mut cursor = from;
        loop {
            let seg_end = next_slot_pos(&text, from);
            if cursor >= seg_end {
                break;
            }
            let Some(rel) = text[cursor..seg_end].find('[') else {
                break;
            };
            let open = cursor + rel;
            let Some(marker) = parse_range_marker(&text[open..seg_end]) else {
                cursor = open + 1;
                continue;
            };
            let close = open + marker.len;
            let mut value = Value::Num(self.sample_range(&marker)?);

            // A `%...%` span straight after the bracket either post-processes
            // the sample or stores it under a state key.
            let mut remove_to = close;
            let mut store_key: Option<String> = None;
            if text[close..].starts_with('%') {
                if let Some(qrel) = text[close + 1..].find('%') {
                    let q = close + 1 + qrel;
                    let raw = &text[close..=q];
                    match clause::parse(raw) {
                        Ok(Clause::ValueMod { .. } | Clause::ConditionalValueMod { .. }) => {
                            value =
                                clause::evaluate_value_modification(raw, value, &self.state)?;
                            remove_to = q + 1;
                        }
                        Ok(Clause::Interpolation { cond: None, name }) => {
                            store_key = Some(name);
                            remove_to = q + 1;
                        }
                        _ => {}
                    }
                }
            }

            let value = value.floored();
            if let Some(key) = store_key {
                self.state.insert(key, value.clone());
            }
            text.replace_range(open..remove_to, &value.to_string());
            cursor = open;
        }
        Ok(text)
    }

    fn sample_range(&mut self, marker: &RangeMarker) -> Result<f64, GenError> {
        match marker.kind {
            RangeKind::Uniform => {
                if marker.n > marker.m {
                    return Err(GenError::Range(format!(
                        "empty range [{}-{}]",
                        marker.n, marker.m
                    )));
                }
                Ok(self.rng.gen_range(marker.n..=marker.m) as f64)
            }
            RangeKind::Gaussian => {
                let dist = Normal::new(marker.n as f64, marker.m as f64)
                    .map_err(|e| GenError::Range(e.to_string()))?;
                Ok(dist.sample(&mut *self.rng))
            }
            RangeKind::Gamma => {
                let dist = Gamma::new(marker.n as f64, marker.m as f64)
                    .map_err(|e| GenError::Range(e.to_string()))?;
                Ok(dist.sample(&mut *self.rng))
            }
        }
    }

    fn make_subtable_calls(&mut self, mut text: String, from: usize) -> Result<String, GenError> {
        let mut cursor = from;
        loop {
            let seg_end = next_slot_pos(&text, from);
            if cursor >= seg_end {
                break;
            }
            let Some(rel) = text[cursor..seg_end].find('@') else {
                break;
            };
            let at = cursor + rel;
            let Some(call) = parse_subtable_ref(&text[at..seg_end]) else {
                cursor = at + 1;
                continue;
            };
            let full_match = text[at..at + call.len].to_string();

            let count = match call.count {
                CountSpec::One => 1,
                CountSpec::Exact(n) => n,
                CountSpec::Between(a, b) => {
                    if a > b {
                        return Err(GenError::Range(format!(
                            "empty count range in `{}`",
                            full_match
                        )));
                    }
                    self.rng.gen_range(a..=b)
                }
            };
            if count == 0 {
                return Err(GenError::Range(format!(
                    "subtable count in `{}` must be positive",
                    full_match
                )));
            }

            let subtable = self
                .table
                .subtable(&call.name)
                .ok_or_else(|| GenError::UnknownSubtable(call.name.clone()))?;
            log::debug!(
                "calling subtable `{}` with count {} and uniqueness {}",
                call.name,
                count,
                call.uniqueness
            );
            let params = GenParams {
                count,
                uniqueness_level: call.uniqueness,
                uniqueness_mode: Uniqueness::Each,
            };
            let (results, sub_state) = subtable.gen_choices_with_state(&params, &mut *self.rng)?;
            self.state.extend(sub_state);

            if let Some(stripped) = remove_enclosing_braces(&text, at) {
                text = stripped;
            }
            text = text.replacen(&full_match, &results[0], 1);
            text = replace_numbered_markers(text, &results, &call.name);
            cursor = from;
        }
        Ok(text)
    }

    fn pick(
        &mut self,
        container: Option<ChoiceId>,
        tag: u32,
        template: &str,
    ) -> Result<ChoiceId, GenError> {
        let children: &[ChoiceId] = match container {
            Some(id) => self.table.children_of(id),
            None => self.table.roots(),
        };

        let mut candidates = Vec::new();
        let mut weights = Vec::new();
        for &id in children {
            let node = self.table.node(id);
            if node.tag != tag || self.used.contains(&id) {
                continue;
            }
            let weight = match &node.clause {
                Some(raw) => clause::evaluate_value_modification(
                    raw,
                    Value::Num(node.weight as f64),
                    &self.state,
                )?
                .as_number()
                .map(|n| n as i64)
                .unwrap_or(0),
                None => node.weight,
            };
            candidates.push(id);
            weights.push(weight);
        }

        let total: i64 = weights.iter().sum();
        if total <= 0 {
            return Err(GenError::ExhaustedChoices {
                level: self.level,
                tag,
                template: template.to_string(),
                retired: self.used.len(),
            });
        }

        let mut roll = self.rng.gen_range(1..=total);
        for (idx, &weight) in weights.iter().enumerate() {
            roll -= weight;
            if roll <= 0 {
                return Ok(candidates[idx]);
            }
        }
        unreachable!("cumulative draw always lands inside a positive total")
    }

    /// Retire a node and transitively every ancestor all of whose children
    /// sharing the retired node's slot are now retired.
    fn retire(&mut self, picked: ChoiceId) {
        self.used.insert(picked);
        let mut last = picked;
        for &(_, ancestor) in self.backtrace.iter().rev() {
            let tag = self.table.node(last).tag;
            let spent = self
                .table
                .children_of(ancestor)
                .iter()
                .filter(|&&sibling| self.table.node(sibling).tag == tag)
                .all(|sibling| self.used.contains(sibling));
            if !spent {
                break;
            }
            self.used.insert(ancestor);
            last = ancestor;
        }
    }

    /// Final sweep: apply and strip every remaining state-modification
    /// clause. The `:@` snapshot form receives the swept text.
    fn extract_state(&mut self, text: String) -> Result<String, GenError> {
        let mut spans: Vec<(usize, usize, Clause)> = Vec::new();
        let mut search = 0;
        while let Some(rel) = text[search..].find(" %") {
            let p = search + rel;
            let Some(qrel) = text[p + 2..].find('%') else {
                break;
            };
            let q = p + 2 + qrel;
            match clause::parse(&text[p..=q]) {
                Ok(c @ (Clause::StateMod { .. } | Clause::ConditionalStateMod { .. })) => {
                    spans.push((p, q, c));
                    search = q + 1;
                }
                _ => search = p + 1,
            }
        }
        if spans.is_empty() {
            return Ok(text);
        }

        let mut cleaned = String::with_capacity(text.len());
        let mut last = 0;
        for (p, q, _) in &spans {
            cleaned.push_str(&text[last..*p]);
            last = q + 1;
        }
        cleaned.push_str(&text[last..]);

        for (p, q, parsed) in spans {
            let raw = &text[p..=q];
            let (name, value) =
                clause::apply_state_modification(&parsed, raw, &cleaned, &self.state)?;
            log::debug!("state write `{}` = {}", name, value);
            self.state.insert(name, value);
        }
        Ok(cleaned)
    }
}

/// The explicit `$[i]` marker for a slot, falling back to the first
/// remaining bare `$`.
fn find_marker(text: &str, explicit: &str) -> Option<(usize, usize)> {
    if let Some(pos) = text.find(explicit) {
        return Some((pos, explicit.len()));
    }
    text.find('$').map(|pos| (pos, 1))
}

fn next_slot_pos(text: &str, from: usize) -> usize {
    text[from..]
        .find('$')
        .map(|p| from + p)
        .unwrap_or(text.len())
}

#[derive(Debug, Clone, Copy)]
enum RangeKind {
    Uniform,
    Gaussian,
    Gamma,
}

struct RangeMarker {
    len: usize,
    n: i64,
    m: i64,
    kind: RangeKind,
}

/// Parse `[n-m]`, `[n-mN]`, or `[n-mG]` at the head of `s`.
fn parse_range_marker(s: &str) -> Option<RangeMarker> {
    let bytes = s.as_bytes();
    let mut i = 1; // past '['
    let n = take_digits(bytes, &mut i)?;
    if bytes.get(i) != Some(&b'-') {
        return None;
    }
    i += 1;
    let m = take_digits(bytes, &mut i)?;
    let kind = match bytes.get(i) {
        Some(b'N') => {
            i += 1;
            RangeKind::Gaussian
        }
        Some(b'G') => {
            i += 1;
            RangeKind::Gamma
        }
        _ => RangeKind::Uniform,
    };
    if bytes.get(i) != Some(&b']') {
        return None;
    }
    Some(RangeMarker {
        len: i + 1,
        n,
        m,
        kind,
    })
}

enum CountSpec {
    One,
    Exact(usize),
    Between(usize, usize),
}

struct SubtableCall {
    len: usize,
    name: String,
    count: CountSpec,
    uniqueness: i32,
}

/// Parse `@name`, `@name[a, u]`, or `@name[a-b, u]` at the head of `s`.
/// Numbered markers (`@2name`) deliberately do not parse as calls.
fn parse_subtable_ref(s: &str) -> Option<SubtableCall> {
    let bytes = s.as_bytes();
    let mut i = 1; // past '@'
    while i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
        i += 1;
    }
    if i == 1 {
        return None;
    }
    let name = s[1..i].to_string();
    let plain = SubtableCall {
        len: i,
        name: name.clone(),
        count: CountSpec::One,
        uniqueness: 0,
    };

    if bytes.get(i) != Some(&b'[') {
        return Some(plain);
    }
    let mut j = i + 1;
    let Some(a) = take_digits(bytes, &mut j) else {
        return Some(plain);
    };
    let count = if bytes.get(j) == Some(&b'-') {
        j += 1;
        let Some(b) = take_digits(bytes, &mut j) else {
            return Some(plain);
        };
        CountSpec::Between(a as usize, b as usize)
    } else {
        CountSpec::Exact(a as usize)
    };
    if bytes.get(j) != Some(&b',') {
        return Some(plain);
    }
    j += 1;
    if bytes.get(j) == Some(&b' ') {
        j += 1;
    }
    let negative = bytes.get(j) == Some(&b'-');
    if negative {
        j += 1;
    }
    let Some(u) = take_digits(bytes, &mut j) else {
        return Some(plain);
    };
    if bytes.get(j) != Some(&b']') {
        return Some(plain);
    }
    Some(SubtableCall {
        len: j + 1,
        name,
        count,
        uniqueness: if negative { -(u as i32) } else { u as i32 },
    })
}

fn take_digits(bytes: &[u8], i: &mut usize) -> Option<i64> {
    let start = *i;
    while *i < bytes.len() && bytes[*i].is_ascii_digit() {
        *i += 1;
    }
    if *i == start {
        return None;
    }
    std::str::from_utf8(&bytes[start..*i]).ok()?.parse().ok()
}

fn replace_numbered_markers(mut text: String, results: &[String], name: &str) -> String {
    let mut i = 2;
    for result in results.iter().skip(1) {
        let marker = format!("@{}{}", i, name);
        if let Some(pos) = text.find(&marker) {
            if let Some(stripped) = remove_enclosing_braces(&text, pos) {
                text = stripped;
            }
            text = text.replacen(&marker, result, 1);
        }
        i += 1;
    }
    // Markers the generated count never reached disappear with their
    // brace group.
    loop {
        let marker = format!("@{}{}", i, name);
        let Some(pos) = text.find(&marker) else {
            break;
        };
        text = match remove_brace_group(&text, pos) {
            Some(t) => t,
            None => {
                let mut t = text;
                t.replace_range(pos..pos + marker.len(), "");
                t
            }
        };
        i += 1;
    }
    text
}

/// Locate the balanced brace pair enclosing `pos`, if any.
fn enclosing_braces(text: &str, pos: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return None;
    }

    let mut depth = 0i32;
    let mut open = None;
    let mut i = pos.min(bytes.len() - 1) as isize;
    while i >= 0 {
        match bytes[i as usize] {
            b'{' => {
                depth -= 1;
                if depth < 0 {
                    open = Some(i as usize);
                    break;
                }
            }
            b'}' => depth += 1,
            _ => {}
        }
        i -= 1;
    }
    let open = open?;

    let mut depth = 0i32;
    let mut i = pos;
    while i < bytes.len() {
        match bytes[i] {
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return Some((open, i));
                }
            }
            b'{' => depth += 1,
            _ => {}
        }
        i += 1;
    }
    log::debug!("unmatched `{{` at byte {} in `{}`", open, text);
    None
}

/// Strip the braces enclosing `pos`, keeping their contents.
fn remove_enclosing_braces(text: &str, pos: usize) -> Option<String> {
    let (open, close) = enclosing_braces(text, pos)?;
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..open]);
    out.push_str(&text[open + 1..close]);
    out.push_str(&text[close + 1..]);
    Some(out)
}

/// Delete the brace group enclosing `pos`, contents included.
fn remove_brace_group(text: &str, pos: usize) -> Option<String> {
    let (open, close) = enclosing_braces(text, pos)?;
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..open]);
    out.push_str(&text[close + 1..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    fn parse_table(doc: &str) -> ChoiceTable {
        let (table, _) = ChoiceTable::parse(doc).unwrap();
        table
    }

    #[test]
    fn flat_table_generates_each_root() {
        let table = ChoiceTable::from_weighted_strings(
            "letters",
            &[(1, "a"), (1, "b"), (1, "c")],
        )
        .unwrap();
        let results = table
            .gen_choices(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(["a", "b", "c"].contains(&results[0].as_str()));
    }

    #[test]
    fn selection_frequency_tracks_weights() {
        let table = ChoiceTable::from_weighted_strings(
            "weighted",
            &[(1, "a"), (2, "b"), (3, "c"), (4, "d")],
        )
        .unwrap();
        let params = GenParams {
            count: 10_000,
            ..GenParams::default()
        };
        let results = table.gen_choices(&params, &mut rng(42)).unwrap();
        let freq = |s: &str| results.iter().filter(|r| r.as_str() == s).count() as f64 / 10_000.0;
        assert!((freq("a") - 0.1).abs() < 0.04, "a: {}", freq("a"));
        assert!((freq("b") - 0.2).abs() < 0.04, "b: {}", freq("b"));
        assert!((freq("c") - 0.3).abs() < 0.04, "c: {}", freq("c"));
        assert!((freq("d") - 0.4).abs() < 0.04, "d: {}", freq("d"));
    }

    #[test]
    fn zero_weight_is_never_picked() {
        let table =
            ChoiceTable::from_weighted_strings("z", &[(0, "never"), (5, "always")]).unwrap();
        let params = GenParams {
            count: 200,
            ..GenParams::default()
        };
        for result in table.gen_choices(&params, &mut rng(7)).unwrap() {
            assert_eq!(result, "always");
        }
    }

    #[test]
    fn clause_adjusted_zero_weight_is_never_picked() {
        let doc = "z\n\n1 $\n  9%=0% never\n  1 always\n";
        let table = parse_table(doc);
        let params = GenParams {
            count: 100,
            ..GenParams::default()
        };
        for result in table.gen_choices(&params, &mut rng(11)).unwrap() {
            assert_eq!(result, "always");
        }
    }

    #[test]
    fn all_zero_weights_exhaust() {
        let table = ChoiceTable::from_weighted_strings("z", &[(0, "a"), (0, "b")]).unwrap();
        assert!(matches!(
            table.gen_choices(&GenParams::default(), &mut rng(1)),
            Err(GenError::ExhaustedChoices { .. })
        ));
    }

    #[test]
    fn leaf_uniqueness_exhausts_after_every_leaf() {
        let table = ChoiceTable::from_weighted_strings(
            "u",
            &[(1, "a"), (1, "b"), (1, "c"), (1, "d")],
        )
        .unwrap();
        let params = GenParams {
            count: 4,
            uniqueness_level: -1,
            ..GenParams::default()
        };
        let results = table.gen_choices(&params, &mut rng(3)).unwrap();
        let distinct: std::collections::HashSet<&str> =
            results.iter().map(String::as_str).collect();
        assert_eq!(distinct.len(), 4);

        let params = GenParams {
            count: 5,
            uniqueness_level: -1,
            ..GenParams::default()
        };
        assert!(matches!(
            table.gen_choices(&params, &mut rng(3)),
            Err(GenError::ExhaustedChoices { .. })
        ));
    }

    #[test]
    fn leaf_retirement_propagates_to_spent_ancestors() {
        let doc = "u\n\n1 $\n  1 $\n    1 x\n    1 y\n  1 $\n    1 z\n";
        let table = parse_table(doc);
        let params = GenParams {
            count: 3,
            uniqueness_level: -1,
            ..GenParams::default()
        };
        let results = table.gen_choices(&params, &mut rng(5)).unwrap();
        let distinct: std::collections::HashSet<&str> =
            results.iter().map(String::as_str).collect();
        assert_eq!(
            distinct,
            ["x", "y", "z"].into_iter().collect::<std::collections::HashSet<_>>()
        );

        let params = GenParams {
            count: 4,
            uniqueness_level: -1,
            ..GenParams::default()
        };
        assert!(matches!(
            table.gen_choices(&params, &mut rng(5)),
            Err(GenError::ExhaustedChoices { .. })
        ));
    }

    #[test]
    fn level_uniqueness_retires_at_that_depth() {
        let doc = "u\n\n1 $\n  1 a\n  1 b\n";
        let table = parse_table(doc);
        // Level 2 retires the children; two draws use both of them.
        let params = GenParams {
            count: 2,
            uniqueness_level: 2,
            ..GenParams::default()
        };
        let results = table.gen_choices(&params, &mut rng(9)).unwrap();
        let distinct: std::collections::HashSet<&str> =
            results.iter().map(String::as_str).collect();
        assert_eq!(distinct.len(), 2);
    }

    #[test]
    fn uniform_range_stays_in_bounds() {
        let table = ChoiceTable::from_weighted_strings("r", &[(1, "[2-5]")]).unwrap();
        let params = GenParams {
            count: 10_000,
            ..GenParams::default()
        };
        for result in table.gen_choices(&params, &mut rng(13)).unwrap() {
            let n: i64 = result.parse().unwrap();
            assert!((2..=5).contains(&n), "out of bounds: {}", n);
        }
    }

    #[test]
    fn gaussian_and_gamma_ranges_floor_to_integers() {
        let table =
            ChoiceTable::from_weighted_strings("r", &[(1, "[10-2N] and [3-2G]")]).unwrap();
        let params = GenParams {
            count: 50,
            ..GenParams::default()
        };
        for result in table.gen_choices(&params, &mut rng(17)).unwrap() {
            let (a, b) = result.split_once(" and ").unwrap();
            let _: i64 = a.parse().unwrap();
            let _: i64 = b.parse().unwrap();
        }
    }

    #[test]
    fn range_post_clause_modifies_sample() {
        let table = ChoiceTable::from_weighted_strings("r", &[(1, "[3-3]%+=2% coins")]).unwrap();
        let results = table
            .gen_choices(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "5 coins");
    }

    #[test]
    fn range_storage_feeds_later_interpolation() {
        let doc = "r\n\n1 [4-4]%gold% then $\n  1 worth %gold%\n";
        let table = parse_table(doc);
        let (results, state) = table
            .gen_choices_with_state(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "4 then worth 4");
        assert_eq!(state.get("gold"), Some(&Value::Num(4.0)));
    }

    #[test]
    fn state_modification_is_swept_from_output() {
        let table =
            ChoiceTable::from_weighted_strings("s", &[(1, "ran %times:+=1%")]).unwrap();
        let params = GenParams {
            count: 3,
            ..GenParams::default()
        };
        let (results, state) = table
            .gen_choices_with_state(&params, &mut rng(1))
            .unwrap();
        for result in &results {
            assert_eq!(result, "ran");
        }
        // State persists across the repetitions of one call.
        assert_eq!(state.get("times"), Some(&Value::Num(3.0)));
    }

    #[test]
    fn snapshot_records_swept_text() {
        let table =
            ChoiceTable::from_weighted_strings("s", &[(1, "a rusty sword %item:@%")]).unwrap();
        let (results, state) = table
            .gen_choices_with_state(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "a rusty sword");
        assert_eq!(state.get("item"), Some(&Value::from("a rusty sword")));
    }

    #[test]
    fn missing_interpolation_deletes_brace_group() {
        let table =
            ChoiceTable::from_weighted_strings("i", &[(1, "a{ b %missing%} c")]).unwrap();
        let results = table
            .gen_choices(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "a c");
    }

    #[test]
    fn present_interpolation_strips_braces() {
        let doc = "i\n\n1 [7-7]%gold% coin$\n  1 { in a purse of %gold%}\n";
        let table = parse_table(doc);
        let results = table
            .gen_choices(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "7 coin in a purse of 7");
    }

    #[test]
    fn brace_group_deletion_may_swallow_a_slot() {
        // The missing interpolation removes the whole optional group, slot
        // included; the expansion for that slot is simply dropped.
        let doc = "b\n\n1 a{ $ is %missing%} b\n  1 x\n";
        let table = parse_table(doc);
        let results = table
            .gen_choices(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "a b");
    }

    #[test]
    fn manual_slot_ordering_sets_state_first() {
        let doc = "m\n\n1 $[2] after $[1]\n  1 one %seen:=1%\n  $\n  5%seen==1->=0% never\n  1 always\n";
        let table = parse_table(doc);
        let params = GenParams {
            count: 20,
            ..GenParams::default()
        };
        for result in table.gen_choices(&params, &mut rng(23)).unwrap() {
            assert_eq!(result, "always after one");
        }
    }

    #[test]
    fn subtable_call_merges_state_and_substitutes() {
        let mut outer =
            ChoiceTable::from_weighted_strings("outer", &[(1, "from @towns")]).unwrap();
        let towns = ChoiceTable::from_weighted_strings(
            "towns",
            &[(1, "Oakburg %visited:+=1%")],
        )
        .unwrap();
        outer.register_subtable(towns);
        let (results, state) = outer
            .gen_choices_with_state(&GenParams::default(), &mut rng(1))
            .unwrap();
        assert_eq!(results[0], "from Oakburg");
        assert_eq!(state.get("visited"), Some(&Value::Num(1.0)));
    }

    #[test]
    fn subtable_numbered_markers_and_brace_groups() {
        let mut outer = ChoiceTable::from_weighted_strings(
            "outer",
            &[(1, "@town[2-3, -1]{ and @2town}{ and @3town}{ and @4town}")],
        )
        .unwrap();
        let town = ChoiceTable::from_weighted_strings(
            "town",
            &[(1, "Ash"), (1, "Birch"), (1, "Cedar"), (1, "Dorn"), (1, "Elm")],
        )
        .unwrap();
        outer.register_subtable(town);

        for seed in 0..20 {
            let results = outer
                .gen_choices(&GenParams::default(), &mut rng(seed))
                .unwrap();
            let text = &results[0];
            assert!(!text.contains('@'), "unreplaced marker in `{}`", text);
            assert!(!text.contains('{'), "leftover brace in `{}`", text);
            let names: Vec<&str> = text.split(" and ").collect();
            assert!(
                (2..=3).contains(&names.len()),
                "expected 2-3 names in `{}`",
                text
            );
            let distinct: std::collections::HashSet<&&str> = names.iter().collect();
            assert_eq!(distinct.len(), names.len(), "repeat in `{}`", text);
        }
    }

    #[test]
    fn unknown_subtable_errors() {
        let table = ChoiceTable::from_weighted_strings("o", &[(1, "@nowhere")]).unwrap();
        assert!(matches!(
            table.gen_choices(&GenParams::default(), &mut rng(1)),
            Err(GenError::UnknownSubtable(name)) if name == "nowhere"
        ));
    }

    #[test]
    fn deterministic_under_a_fixed_seed() {
        let doc = "d\n\n1 $ rolled [1-20]\n  3 warrior\n  2 rogue\n  1 wizard\n";
        let table = parse_table(doc);
        let params = GenParams {
            count: 5,
            ..GenParams::default()
        };
        let first = table.gen_choices(&params, &mut rng(99)).unwrap();
        let second = table.gen_choices(&params, &mut rng(99)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn conditional_weight_reads_live_state() {
        // The first repetition flips a state bit that zeroes its own weight
        // and unlocks the other root, so the sequence is forced.
        let doc = "w\n\n9%flip==1->=0% a %flip:=1%\n\n0%flip==1->=9% b\n";
        let table = parse_table(doc);
        let params = GenParams {
            count: 2,
            ..GenParams::default()
        };
        let (results, state) = table.gen_choices_with_state(&params, &mut rng(2)).unwrap();
        assert_eq!(results, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state.get("flip"), Some(&Value::Num(1.0)));
    }
}
