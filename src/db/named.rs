//! Named placeholder compilation and query rendering.
//!
//! Templates reference values as `:name`. Compilation splits a template into
//! SQL text and placeholder names, skipping quoted strings, quoted
//! identifiers, comments and dollar-quoted bodies. Binding then resolves every
//! name against a [`NamedArgs`] source and emits Postgres positional markers
//! (`$1`, `$2`, ...), optionally expanding list values for `IN (...)` clauses.

use crate::db::params::{NamedArgs, Param};
use crate::error::{DbError, DbResult};

/// Postgres accepts at most this many bind parameters per statement.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// How named placeholders are turned into positional arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// One positional marker per placeholder occurrence.
    #[default]
    Plain,
    /// Like `Plain`, but a placeholder bound to a list expands into one marker
    /// per element. Use only for queries with a list-valued `IN (...)` clause.
    InExpansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Sql(&'a str),
    Name(&'a str),
}

/// A template split into SQL text and placeholder names.
#[derive(Debug, Clone)]
pub struct NamedQuery<'a> {
    segments: Vec<Segment<'a>>,
}

/// Driver-ready statement: positional SQL plus arguments in marker order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub args: Vec<Param>,
}

impl<'a> NamedQuery<'a> {
    pub fn compile(template: &'a str) -> Self {
        let bytes = template.as_bytes();
        let mut segments = Vec::new();
        let mut state = State::Normal;
        let mut start = 0;
        let mut idx = 0;

        while idx < bytes.len() {
            let b = bytes[idx];
            match state {
                State::Normal => match b {
                    b'\'' => state = State::SingleQuoted,
                    b'"' => state = State::DoubleQuoted,
                    b'-' if bytes.get(idx + 1) == Some(&b'-') => {
                        state = State::LineComment;
                        idx += 1;
                    }
                    b'/' if bytes.get(idx + 1) == Some(&b'*') => {
                        state = State::BlockComment(1);
                        idx += 1;
                    }
                    b'$' => {
                        if let Some((tag, advance)) = try_start_dollar_quote(bytes, idx) {
                            state = State::DollarQuoted(tag);
                            idx = advance;
                        }
                    }
                    // `::` is a type cast.
                    b':' if bytes.get(idx + 1) == Some(&b':') => idx += 1,
                    b':' => {
                        if let Some(end) = scan_name(bytes, idx + 1) {
                            if start < idx {
                                segments.push(Segment::Sql(&template[start..idx]));
                            }
                            segments.push(Segment::Name(&template[idx + 1..end]));
                            start = end;
                            idx = end;
                            continue;
                        }
                    }
                    _ => {}
                },
                State::SingleQuoted => {
                    if b == b'\'' {
                        if bytes.get(idx + 1) == Some(&b'\'') {
                            idx += 1;
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::DoubleQuoted => {
                    if b == b'"' {
                        if bytes.get(idx + 1) == Some(&b'"') {
                            idx += 1;
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        state = State::Normal;
                    }
                }
                State::BlockComment(depth) => {
                    if b == b'/' && bytes.get(idx + 1) == Some(&b'*') {
                        state = State::BlockComment(depth + 1);
                        idx += 1;
                    } else if b == b'*' && bytes.get(idx + 1) == Some(&b'/') {
                        state = if depth == 1 {
                            State::Normal
                        } else {
                            State::BlockComment(depth - 1)
                        };
                        idx += 1;
                    }
                }
                State::DollarQuoted(ref tag) => {
                    if b == b'$' && matches_tag(bytes, idx, tag) {
                        idx += tag.len() + 1;
                        state = State::Normal;
                    }
                }
            }
            idx += 1;
        }

        if start < template.len() {
            segments.push(Segment::Sql(&template[start..]));
        }

        Self { segments }
    }

    /// Placeholder names in order of appearance, repeats included.
    pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Name(n) => Some(*n),
            Segment::Sql(_) => None,
        })
    }

    /// Resolve every placeholder occurrence against `args`.
    ///
    /// Fails on the first name the source cannot provide.
    pub fn resolve<A: NamedArgs + ?Sized>(&self, args: &A) -> DbResult<Vec<Param>> {
        self.names()
            .map(|name| {
                args.lookup(name).ok_or_else(|| {
                    DbError::bind(format!("could not find name {name} in argument"))
                })
            })
            .collect()
    }

    /// Produce positional SQL and its arguments.
    pub fn bind<A: NamedArgs + ?Sized>(&self, args: &A, binding: Binding) -> DbResult<BoundQuery> {
        let values = self.resolve(args)?;
        let mut values = values.into_iter();
        let mut sql = String::new();
        let mut bound = Vec::new();

        for segment in &self.segments {
            let name = match segment {
                Segment::Sql(text) => {
                    sql.push_str(text);
                    continue;
                }
                Segment::Name(name) => name,
            };
            let value = values
                .next()
                .ok_or_else(|| DbError::bind(format!("no value resolved for {name}")))?;

            match (binding, value) {
                (Binding::InExpansion, Param::List(items)) if items.is_empty() => {
                    // `NOT IN (NULL)` is never true, so it cannot mean "every row".
                    if follows_not_in(&sql) {
                        return Err(DbError::bind(format!(
                            "empty list bound to {name} in a NOT IN clause"
                        )));
                    }
                    sql.push_str("NULL");
                }
                (Binding::InExpansion, Param::List(items)) => {
                    for (i, item) in items.into_iter().enumerate() {
                        if i > 0 {
                            sql.push_str(", ");
                        }
                        bound.push(item);
                        push_marker(&mut sql, bound.len());
                    }
                }
                (_, value) => {
                    bound.push(value);
                    push_marker(&mut sql, bound.len());
                }
            }
        }

        if bound.len() > MAX_BIND_PARAMS {
            return Err(DbError::bind(format!(
                "{} bind parameters exceed the limit of {MAX_BIND_PARAMS}",
                bound.len()
            )));
        }

        Ok(BoundQuery { sql, args: bound })
    }

    /// Substitute printable literals for every placeholder. Display only.
    fn display(&self, values: &[Param]) -> String {
        let mut values = values.iter();
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Sql(text) => out.push_str(text),
                Segment::Name(_) => {
                    if let Some(value) = values.next() {
                        out.push_str(&value.to_string());
                    }
                }
            }
        }
        out
    }
}

/// Pretty-print a template with its parameters substituted, for logs and
/// spans. Never executed. Resolution failures are returned as the text.
pub fn render<A: NamedArgs + ?Sized>(template: &str, args: &A) -> String {
    let compiled = NamedQuery::compile(template);
    let query = match compiled.resolve(args) {
        Ok(values) => compiled.display(&values),
        Err(e) => return e.to_string(),
    };

    query.replace('\t', "").replace('\n', " ").trim().to_string()
}

fn push_marker(sql: &mut String, position: usize) {
    sql.push('$');
    sql.push_str(&position.to_string());
}

/// True when `sql` ends with `NOT IN (`, ignoring case and whitespace.
fn follows_not_in(sql: &str) -> bool {
    let Some(rest) = sql.trim_end().strip_suffix('(') else {
        return false;
    };
    strip_keyword(rest.trim_end(), "in")
        .and_then(|rest| strip_keyword(rest.trim_end(), "not"))
        .is_some()
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let split = text.len().checked_sub(keyword.len())?;
    if !text.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = text.split_at(split);
    if !tail.eq_ignore_ascii_case(keyword) {
        return None;
    }
    match head.chars().next_back() {
        Some(c) if c.is_alphanumeric() || c == '_' || c == '$' => None,
        _ => Some(head),
    }
}

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Scan a placeholder name starting at `start`. Returns the end offset.
///
/// Names may contain dots between segments (`:user.id`); a trailing dot is
/// left in the SQL. Names starting with a digit are not placeholders, so array
/// slices like `a[1:2]` pass through.
fn scan_name(bytes: &[u8], start: usize) -> Option<usize> {
    if !bytes.get(start).copied().is_some_and(is_name_start) {
        return None;
    }
    let mut idx = start + 1;
    loop {
        match bytes.get(idx) {
            Some(&b) if is_name_char(b) => idx += 1,
            Some(b'.') if bytes.get(idx + 1).copied().is_some_and(is_name_start) => idx += 2,
            _ => return Some(idx),
        }
    }
}

fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    if bytes.get(idx).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }

    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len()
        && bytes[idx + 1..end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}
