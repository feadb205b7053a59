//! Plan parser: planner text in, validated task DAG out.
//!
//! # Grammar
//! ```text
//! Thought: <free text, becomes the rationale of the next entry>
//! <n>. <tool>(<arg>, <key>=<arg>, ...)   [# depends on $i, $j | # depends on none]
//! <n>. join()
//! ```
//!
//! An argument is a quoted string, a number, `True`/`False`/`None`
//! (or `true`/`false`/`null`), a `[...]` list, or a back-reference `$k` /
//! `${k}` to the result of task `k`.
//!
//! Inside a quoted string, `${k}` is always a reference. A bare `$k` inside
//! a string only counts as a reference when `k` names an earlier task, so
//! text like `"under $1500/person"` stays literal.
//!
//! Lines matching neither form are ignored, so planners may surround the
//! plan with prose.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Number, Value};

use super::graph::Plan;
use super::task::{ArgValue, Argument, Fragment, Task, TaskId, JOIN_TOOL};

static THOUGHT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Thought:\s*(.*?)\s*$").expect("valid thought regex"));

/// `<n>. <tool>(` followed by the rest of the line; [`split_call`] finds
/// where the call ends.
static ACTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\.\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*\((.*)$").expect("valid action regex")
});

static REFERENCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:\{(\d+)\}|(\d+))").expect("valid reference regex"));

static FULL_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$(?:\{(\d+)\}|(\d+))$").expect("valid reference regex"));

static KEYWORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*([^=].*)$").expect("valid keyword regex")
});

static DEPENDS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#\s*depends\s+on\s*:?\s*(.*)$").expect("valid depends regex")
});

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid id regex"));

/// Errors produced while turning planner text into a [`Plan`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Task {task} references ${reference}, which is not an earlier task")]
    DanglingReference { task: TaskId, reference: TaskId },

    #[error("Task {task} references ${reference}, which does not exist in the plan")]
    UnknownReference { task: TaskId, reference: TaskId },

    #[error("Malformed plan at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Entry at line {line} is numbered {found}, expected {expected}")]
    OutOfOrder {
        line: usize,
        expected: u32,
        found: u32,
    },

    #[error("Task {task} uses unknown tool '{tool}'")]
    UnknownTool { task: TaskId, tool: String },

    #[error("Second join entry at line {line}")]
    MultipleJoins { line: usize },

    #[error("Entry at line {line} follows the join entry")]
    JoinNotLast { line: usize },

    #[error("Plan contains no tasks")]
    EmptyPlan,
}

fn malformed(line: usize, reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        line,
        reason: reason.into(),
    }
}

/// Stateless parser configuration.
#[derive(Debug, Clone, Default)]
pub struct PlanParser {
    known_tools: Option<HashSet<String>>,
}

impl PlanParser {
    /// Parser accepting any tool name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser rejecting tools outside `names` with [`ParseError::UnknownTool`].
    pub fn with_known_tools<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_tools: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse a complete planner response.
    pub fn parse(&self, text: &str) -> Result<Plan, ParseError> {
        let mut stream = self.stream();
        stream.push(text)?;
        stream.finish()
    }

    /// Start an incremental parse.
    pub fn stream(&self) -> PlanStream {
        PlanStream {
            known_tools: self.known_tools.clone(),
            buffer: String::new(),
            line_no: 0,
            thought: None,
            tasks: Vec::new(),
            join_seen: false,
        }
    }
}

/// Incremental parser fed with chunks of planner output.
///
/// Complete lines are syntax-checked as soon as their newline arrives, so a
/// bad entry fails early. Nothing here is executable: references are only
/// validated in [`PlanStream::finish`], and the engine schedules the
/// resulting [`Plan`] as a whole.
#[derive(Debug)]
pub struct PlanStream {
    known_tools: Option<HashSet<String>>,
    buffer: String,
    line_no: usize,
    thought: Option<String>,
    tasks: Vec<Task>,
    join_seen: bool,
}

impl PlanStream {
    /// Feed a chunk; returns how many entries were completed by it.
    pub fn push(&mut self, chunk: &str) -> Result<usize, ParseError> {
        self.buffer.push_str(chunk);
        let mut parsed = 0;

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if self.ingest_line(line.trim_end_matches(['\n', '\r']))? {
                parsed += 1;
            }
        }

        Ok(parsed)
    }

    /// Entries parsed so far.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Flush the last line, close the plan with a join, and validate it.
    pub fn finish(mut self) -> Result<Plan, ParseError> {
        if !self.buffer.trim().is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.ingest_line(line.trim_end_matches('\r'))?;
        }

        let mut tasks = self.tasks;
        if tasks.iter().all(Task::is_join) {
            return Err(ParseError::EmptyPlan);
        }

        let explicit_join = self.join_seen;
        if !explicit_join {
            let id = TaskId::new(tasks.len() as u32 + 1);
            tasks.push(Task::join(id, None));
        }

        validate_references(&tasks)?;
        Ok(Plan::from_tasks(tasks, explicit_join))
    }

    /// Returns `true` if the line produced a task.
    fn ingest_line(&mut self, line: &str) -> Result<bool, ParseError> {
        self.line_no += 1;
        let line_no = self.line_no;

        if let Some(caps) = THOUGHT_PATTERN.captures(line) {
            self.thought = Some(caps[1].to_string());
            return Ok(false);
        }

        let Some(caps) = ACTION_PATTERN.captures(line) else {
            return Ok(false);
        };

        let tool = caps[2].to_string();
        let (raw_args, comment) = split_call(caps.get(3).map_or("", |m| m.as_str()), line_no)?;
        if self.join_seen {
            return Err(if tool == JOIN_TOOL {
                ParseError::MultipleJoins { line: line_no }
            } else {
                ParseError::JoinNotLast { line: line_no }
            });
        }

        let found: u32 = caps[1]
            .parse()
            .map_err(|_| malformed(line_no, "entry number out of range"))?;
        let expected = self.tasks.len() as u32 + 1;
        if found != expected {
            return Err(ParseError::OutOfOrder {
                line: line_no,
                expected,
                found,
            });
        }

        let id = TaskId::new(found);
        let rationale = self.thought.take();

        if tool == JOIN_TOOL {
            self.tasks.push(Task::join(id, rationale));
            self.join_seen = true;
            return Ok(true);
        }

        if let Some(known) = &self.known_tools {
            if !known.contains(&tool) {
                return Err(ParseError::UnknownTool { task: id, tool });
            }
        }

        let arguments = split_top_level(raw_args, line_no)?
            .into_iter()
            .map(|piece| parse_argument(piece, id, line_no))
            .collect::<Result<Vec<_>, _>>()?;

        let explicit = comment
            .map(parse_dependency_annotation)
            .unwrap_or_default();

        self.tasks
            .push(Task::new(id, tool, arguments, explicit, rationale));
        Ok(true)
    }
}

/// Unknown references are reported before dangling ones.
fn validate_references(tasks: &[Task]) -> Result<(), ParseError> {
    let count = tasks.len() as u32;

    for task in tasks {
        if let Some(reference) = task
            .dependencies()
            .iter()
            .find(|dep| dep.get() == 0 || dep.get() > count)
        {
            return Err(ParseError::UnknownReference {
                task: task.id(),
                reference: *reference,
            });
        }
    }

    for task in tasks {
        if let Some(reference) = task.dependencies().iter().find(|dep| **dep >= task.id()) {
            return Err(ParseError::DanglingReference {
                task: task.id(),
                reference: *reference,
            });
        }
    }

    Ok(())
}

/// `# depends on $1, $2` / `# depends on none`; other comments carry no ids.
fn parse_dependency_annotation(comment: &str) -> BTreeSet<TaskId> {
    let Some(caps) = DEPENDS_PATTERN.captures(comment.trim()) else {
        return BTreeSet::new();
    };

    ID_PATTERN
        .find_iter(&caps[1])
        .filter_map(|m| m.as_str().parse::<u32>().ok())
        .map(TaskId::new)
        .collect()
}

/// Split the text after a call's `(` into its arguments and the optional
/// trailing `#` comment. Anything else after the closing `)` is an error.
fn split_call(rest: &str, line: usize) -> Result<(&str, Option<&str>), ParseError> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '(' | '{' => depth += 1,
            ')' if depth == 0 => {
                let tail = rest[i + 1..].trim();
                return match tail {
                    "" => Ok((&rest[..i], None)),
                    comment if comment.starts_with('#') => Ok((&rest[..i], Some(comment))),
                    other => Err(malformed(line, format!("unexpected text after call: '{}'", other))),
                };
            }
            ']' | ')' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed(line, "unbalanced brackets in arguments"))?;
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return Err(malformed(line, "unterminated string literal"));
    }
    Err(malformed(line, "call is missing its closing ')'"))
}

/// Split on commas that are outside quotes and brackets.
fn split_top_level(input: &str, line: usize) -> Result<Vec<&str>, ParseError> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| malformed(line, "unbalanced brackets in arguments"))?;
            }
            ',' if depth == 0 => {
                pieces.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return Err(malformed(line, "unterminated string literal"));
    }
    if depth != 0 {
        return Err(malformed(line, "unbalanced brackets in arguments"));
    }
    pieces.push(input[start..].trim());

    // Tolerate `f()` and a trailing comma, nothing else.
    if pieces.last().is_some_and(|p| p.is_empty()) {
        pieces.pop();
    }
    if pieces.iter().any(|p| p.is_empty()) {
        return Err(malformed(line, "empty argument"));
    }

    Ok(pieces)
}

fn parse_argument(piece: &str, owner: TaskId, line: usize) -> Result<Argument, ParseError> {
    if let Some(caps) = KEYWORD_PATTERN.captures(piece) {
        let value = parse_value(&caps[2], owner, line)?;
        return Ok(Argument::named(&caps[1], value));
    }
    Ok(Argument::positional(parse_value(piece, owner, line)?))
}

fn parse_value(text: &str, owner: TaskId, line: usize) -> Result<ArgValue, ParseError> {
    let text = text.trim();

    if let Some(caps) = FULL_REFERENCE.captures(text) {
        let digits = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        return Ok(ArgValue::Reference(parse_reference_id(digits)));
    }

    match text.chars().next() {
        None => Err(malformed(line, "empty argument")),
        Some(q @ ('"' | '\'')) => {
            if text.len() < 2 || !text.ends_with(q) {
                return Err(malformed(line, "unterminated string literal"));
            }
            let inner = unescape(&text[1..text.len() - 1]);
            Ok(template_or_literal(inner, owner))
        }
        Some('[') => {
            if !text.ends_with(']') {
                return Err(malformed(line, "unterminated list literal"));
            }
            let items = split_top_level(&text[1..text.len() - 1], line)?
                .into_iter()
                .map(|item| parse_value(item, owner, line))
                .collect::<Result<Vec<_>, _>>()?;

            if items.iter().all(ArgValue::is_literal) {
                let values = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ArgValue::Literal(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                Ok(ArgValue::Literal(Value::Array(values)))
            } else {
                Ok(ArgValue::List(items))
            }
        }
        Some(_) => Ok(parse_bare(text, owner)),
    }
}

fn parse_bare(text: &str, owner: TaskId) -> ArgValue {
    match text {
        "True" | "true" => return ArgValue::Literal(Value::Bool(true)),
        "False" | "false" => return ArgValue::Literal(Value::Bool(false)),
        "None" | "null" => return ArgValue::Literal(Value::Null),
        _ => {}
    }

    if let Ok(n) = text.parse::<i64>() {
        return ArgValue::Literal(Value::Number(n.into()));
    }
    if let Some(n) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return ArgValue::Literal(Value::Number(n));
    }

    template_or_literal(text.to_string(), owner)
}

/// Out-of-range ids become `u32::MAX`, which validation reports as unknown.
fn parse_reference_id(digits: &str) -> TaskId {
    TaskId::new(digits.parse().unwrap_or(u32::MAX))
}

fn template_or_literal(text: String, owner: TaskId) -> ArgValue {
    let mut fragments = Vec::new();
    let mut last = 0;

    for caps in REFERENCE_PATTERN.captures_iter(&text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let (digits, braced) = match (caps.get(1), caps.get(2)) {
            (Some(m), _) => (m.as_str(), true),
            (None, Some(m)) => (m.as_str(), false),
            (None, None) => continue,
        };

        let id = parse_reference_id(digits);
        if !braced && !(id.get() >= 1 && id < owner) {
            continue;
        }

        if whole.start > last {
            fragments.push(Fragment::Text(text[last..whole.start].to_string()));
        }
        fragments.push(Fragment::Reference(id));
        last = whole.end;
    }

    if fragments.is_empty() {
        return ArgValue::Literal(Value::String(text));
    }
    if last < text.len() {
        fragments.push(Fragment::Text(text[last..].to_string()));
    }
    ArgValue::Template(fragments)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(e @ ('\\' | '"' | '\'')) => out.push(e),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}
