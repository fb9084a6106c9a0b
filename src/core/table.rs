/// Choice tables — parsing, validation, and loading of the
/// indentation-structured weighted-choice document format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::clause;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("empty choices document")]
    Empty,
    #[error("format error in `{namespace}` at line {line}: {detail}")]
    Format {
        namespace: String,
        line: usize,
        detail: String,
    },
    #[error("import cycle detected while loading `{0}`")]
    ImportCycle(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Index of a choice in its table's arena. Identity, not value equality:
/// two rows with identical text and weight stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChoiceId(usize);

/// One weighted alternative: a weight, a template, the slot it competes
/// for in its parent, and an optional weight-modifying clause.
#[derive(Debug, Clone)]
pub struct Choice {
    pub weight: i64,
    pub text: String,
    pub tag: u32,
    pub clause: Option<String>,
    children: Vec<ChoiceId>,
}

/// A parsed choice tree plus its registered subtables.
#[derive(Debug, Clone, Default)]
pub struct ChoiceTable {
    namespace: String,
    arena: Vec<Choice>,
    roots: Vec<ChoiceId>,
    subtables: HashMap<String, ChoiceTable>,
}

impl ChoiceTable {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn node(&self, id: ChoiceId) -> &Choice {
        &self.arena[id.0]
    }

    pub fn children_of(&self, id: ChoiceId) -> &[ChoiceId] {
        &self.arena[id.0].children
    }

    pub fn roots(&self) -> &[ChoiceId] {
        &self.roots
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn subtable(&self, namespace: &str) -> Option<&ChoiceTable> {
        self.subtables.get(namespace)
    }

    pub fn subtable_names(&self) -> impl Iterator<Item = &str> {
        self.subtables.keys().map(String::as_str)
    }

    /// Register another table as a subtable, keyed by its namespace id.
    pub fn register_subtable(&mut self, table: ChoiceTable) {
        self.subtables.insert(table.namespace.clone(), table);
    }

    /// Parse a full document: namespace line, import declarations, blank
    /// line, then blank-line-separated blocks. Returns the table and the
    /// import filenames still to be resolved by the caller.
    pub fn parse(document: &str) -> Result<(ChoiceTable, Vec<String>), TableError> {
        let lines: Vec<(usize, String)> = document
            .lines()
            .enumerate()
            .filter_map(|(i, raw)| {
                let stripped = match raw.find('#') {
                    Some(pos) => &raw[..pos],
                    None => raw,
                };
                let stripped = stripped.trim_end();
                // A line that was only a comment disappears entirely rather
                // than reading as a block separator.
                if stripped.is_empty() && !raw.trim().is_empty() {
                    None
                } else {
                    Some((i + 1, stripped.to_string()))
                }
            })
            .collect();

        let mut iter = lines.into_iter().peekable();
        let namespace = match iter.next() {
            Some((_, first)) if !first.trim().is_empty() => first.trim().to_string(),
            _ => return Err(TableError::Empty),
        };

        let mut imports = Vec::new();
        while let Some((_, line)) = iter.peek() {
            if line.trim().is_empty() || !line.contains(':') {
                break;
            }
            let (_, line) = iter.next().expect("just peeked");
            let (_, filename) = line.split_once(':').expect("just checked for ':'");
            imports.push(filename.trim().to_string());
        }

        match iter.next() {
            Some((_, line)) if line.trim().is_empty() => {}
            Some((line, _)) => {
                return Err(TableError::Format {
                    namespace,
                    line,
                    detail: "expected a blank line between the header and the first block"
                        .to_string(),
                })
            }
            None => return Err(TableError::Empty),
        }

        let body: Vec<(usize, String)> = iter.collect();
        validate(&namespace, &body)?;

        let mut table = ChoiceTable {
            namespace,
            ..Default::default()
        };
        table.build_blocks(&body)?;
        Ok((table, imports))
    }

    /// Build a flat table from weighted strings, the way a caller supplies
    /// a quick inline subtable.
    pub fn from_weighted_strings(
        namespace: &str,
        choices: &[(i64, &str)],
    ) -> Result<ChoiceTable, TableError> {
        let body = choices
            .iter()
            .map(|(w, text)| format!("{} {}", w, text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let document = format!("{}\n\n{}", namespace, body);
        let (table, _) = Self::parse(&document)?;
        Ok(table)
    }

    /// Load a document from disk, resolving imports recursively relative
    /// to the importing file. Import cycles are refused.
    pub fn load_from_path(path: &Path) -> Result<ChoiceTable, TableError> {
        let mut in_progress = Vec::new();
        Self::load_inner(path, &mut in_progress)
    }

    fn load_inner(path: &Path, in_progress: &mut Vec<PathBuf>) -> Result<ChoiceTable, TableError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if in_progress.contains(&canonical) {
            return Err(TableError::ImportCycle(canonical));
        }
        in_progress.push(canonical);

        let contents = std::fs::read_to_string(path)?;
        let (mut table, imports) = Self::parse(&contents)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        for import in imports {
            let import_path = dir.join(&import);
            let subtable = Self::load_inner(&import_path, in_progress)?;
            log::debug!(
                "registering subtable `{}` on `{}`",
                subtable.namespace,
                table.namespace
            );
            table.register_subtable(subtable);
        }

        in_progress.pop();
        Ok(table)
    }

    fn build_blocks(&mut self, body: &[(usize, String)]) -> Result<(), TableError> {
        for block in body.split(|(_, line)| line.trim().is_empty()) {
            if block.is_empty() {
                continue;
            }
            self.build_block(block)?;
        }
        if self.roots.is_empty() {
            return Err(TableError::Empty);
        }
        Ok(())
    }

    fn build_block(&mut self, block: &[(usize, String)]) -> Result<(), TableError> {
        // `None` is the top-level root list; deeper entries are the node a
        // further-indented line attaches to.
        let mut stack: Vec<Option<ChoiceId>> = vec![None];
        let mut tag_stack: Vec<u32> = vec![1];
        let mut indent = 0usize;
        let mut prev: Option<ChoiceId> = None;

        for (line_no, line) in block {
            let new_indent = line.len() - line.trim_start_matches(' ').len();
            if new_indent > indent {
                stack.push(prev);
                tag_stack.push(1);
            } else if new_indent < indent {
                for _ in 0..(indent - new_indent) / 2 {
                    if stack.len() > 1 {
                        stack.pop();
                        tag_stack.pop();
                    }
                }
            }
            indent = new_indent;

            let content = &line[new_indent..];
            if content == "$" {
                *tag_stack.last_mut().expect("tag stack never empty") += 1;
                continue;
            }

            let tag = *tag_stack.last().expect("tag stack never empty");
            let choice = self.parse_choice_line(content, tag, *line_no)?;
            let id = self.alloc(choice);
            match stack.last().expect("stack never empty") {
                Some(parent) => self.arena[parent.0].children.push(id),
                None => self.roots.push(id),
            }
            prev = Some(id);
        }
        Ok(())
    }

    fn alloc(&mut self, choice: Choice) -> ChoiceId {
        let id = ChoiceId(self.arena.len());
        self.arena.push(choice);
        id
    }

    fn parse_choice_line(
        &self,
        content: &str,
        tag: u32,
        line_no: usize,
    ) -> Result<Choice, TableError> {
        let format_err = |detail: String| TableError::Format {
            namespace: self.namespace.clone(),
            line: line_no,
            detail,
        };

        let (head, tail) = match content.split_once(' ') {
            Some((h, t)) => (h, Some(t)),
            None => (content, None),
        };

        if let Ok(weight) = head.parse::<i64>() {
            return Ok(Choice {
                weight,
                text: tail.unwrap_or("").to_string(),
                tag,
                clause: None,
                children: Vec::new(),
            });
        }

        // A weight that fails to parse means the clause is attached to the
        // weight without a space: `2%+=wealth% text`. Re-split on `%`.
        let mut parts = content.splitn(3, '%');
        let weight_part = parts.next().expect("splitn yields at least one part");
        let clause_part = parts
            .next()
            .ok_or_else(|| format_err(format!("cannot parse weight from `{}`", content)))?;
        let rest = parts
            .next()
            .ok_or_else(|| format_err(format!("unterminated weight clause in `{}`", content)))?;
        let weight = weight_part
            .parse::<i64>()
            .map_err(|_| format_err(format!("cannot parse weight from `{}`", content)))?;
        let text = rest.strip_prefix(' ').ok_or_else(|| {
            format_err(format!(
                "weight clause in `{}` must be followed by a space",
                content
            ))
        })?;

        Ok(Choice {
            weight,
            text: text.to_string(),
            tag,
            clause: Some(format!("%{}%", clause_part)),
            children: Vec::new(),
        })
    }
}

/// Pre-pass structural validation, run before any tree is built.
fn validate(namespace: &str, body: &[(usize, String)]) -> Result<(), TableError> {
    let format_err = |line: usize, detail: String| TableError::Format {
        namespace: namespace.to_string(),
        line,
        detail,
    };

    if body.iter().all(|(_, line)| line.trim().is_empty()) {
        return Err(TableError::Empty);
    }

    let mut must_indent = false;
    let mut prev_indent = 0usize;
    let mut prev_blank = false;
    let mut last_line_no = 0usize;

    for (line_no, line) in body {
        last_line_no = *line_no;
        if line.trim().is_empty() {
            if prev_blank {
                return Err(format_err(*line_no, "two blank lines in a row".to_string()));
            }
            if must_indent {
                return Err(format_err(
                    *line_no,
                    "a line containing a choice slot must be followed by indented children"
                        .to_string(),
                ));
            }
            prev_blank = true;
            prev_indent = 0;
            continue;
        }
        prev_blank = false;

        let indent = line.len() - line.trim_start_matches(' ').len();
        if indent % 2 != 0 {
            return Err(format_err(
                *line_no,
                format!("indentation of {} spaces is not a multiple of 2", indent),
            ));
        }
        if must_indent {
            if indent != prev_indent + 2 {
                return Err(format_err(
                    *line_no,
                    "expected this line to indent under the slot marker above".to_string(),
                ));
            }
            must_indent = false;
        } else if indent > prev_indent {
            return Err(format_err(
                *line_no,
                "indentation may only increase under a line containing a choice slot"
                    .to_string(),
            ));
        }

        let content = &line[indent..];
        let starts_ok = content == "$"
            || content
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false);
        if !starts_ok {
            return Err(format_err(
                *line_no,
                format!("line `{}` must start with a weight or `$`", content),
            ));
        }

        if content != "$" && content.contains('$') {
            must_indent = true;
        }

        validate_clauses(namespace, *line_no, content)?;
        prev_indent = indent;
    }

    if must_indent {
        return Err(format_err(
            last_line_no,
            "a line containing a choice slot must be followed by indented children".to_string(),
        ));
    }
    Ok(())
}

/// Every `%...%` span in a line must parse as one of the five clause
/// forms. A span behind a range marker reads as a value modification or a
/// bare storage key, both of which are valid forms on their own.
fn validate_clauses(namespace: &str, line_no: usize, content: &str) -> Result<(), TableError> {
    let format_err = |detail: String| TableError::Format {
        namespace: namespace.to_string(),
        line: line_no,
        detail,
    };

    let bytes = content.as_bytes();
    let mut search = 0usize;
    while let Some(rel) = content[search..].find('%') {
        let start = search + rel;
        let end = match content[start + 1..].find('%') {
            Some(rel) => start + 1 + rel,
            None => {
                return Err(format_err(format!(
                    "unterminated `%` clause in `{}` (a literal `%` is reserved)",
                    content
                )))
            }
        };

        let leading_space = start > 0 && bytes[start - 1] == b' ';
        let spaced = if leading_space {
            clause::parse(&content[start - 1..=end]).ok()
        } else {
            None
        };
        let parsed = spaced.or_else(|| clause::parse(&content[start..=end]).ok());
        if parsed.is_none() {
            return Err(format_err(format!(
                "clause `{}` does not match any clause form",
                &content[start..=end]
            )));
        }
        search = end + 1;
    }
    Ok(())
}
