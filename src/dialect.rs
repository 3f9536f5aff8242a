// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL → SQLite dialect translation.
//!
//! Call sites write one canonical dialect (PostgreSQL). A [`Statement`] is
//! classified once when it is built; the fallback store then runs
//! [`translate`] on its text. Rules, applied in this order:
//!
//! ```text
//! $1, $2, ...              → ?1, ?2, ...            (ordinal kept)
//! CURRENT_TIMESTAMP, NOW() → datetime('now')
//! RETURNING <cols>         → (removed)
//! SERIAL [PRIMARY KEY]     → INTEGER PRIMARY KEY AUTOINCREMENT
//! ```
//!
//! Quoted literals and quoted identifiers are never rewritten by the
//! placeholder rule. `RETURNING` is only recognized at the top level,
//! outside quotes and parentheses.

use crate::error::DbError;
use regex::Regex;
use std::sync::LazyLock;

static TIMESTAMP_FN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCURRENT_TIMESTAMP\b|\bNOW\s*\(\s*\)").unwrap());

static SERIAL_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:BIG|SMALL)?SERIAL\b(?:\s+PRIMARY\s+KEY\b)?").unwrap());

static INSERT_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*INSERT\s+(?:OR\s+\w+\s+)?INTO\s+("?[\w.]+"?)"#).unwrap()
});

static UPDATE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*UPDATE\s+(?:OR\s+\w+\s+)?("?[\w.]+"?)"#).unwrap());

static UPDATE_SET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^(\s*UPDATE\s+(?:OR\s+\w+\s+)?"?[\w.]+"?\s+SET\s+)"#).unwrap()
});

static DELETE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*DELETE\s+FROM\s+("?[\w.]+"?)"#).unwrap());

/// What a statement does, decided once from its leading keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert { table: String },
    Update { table: String },
    Delete { table: String },
    /// DDL and anything else run for side effect only.
    Other,
}

impl StatementKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert { .. } | Self::Update { .. } | Self::Delete { .. })
    }

    /// Target table of a write statement.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Insert { table } | Self::Update { table } | Self::Delete { table } => Some(table),
            _ => None,
        }
    }
}

/// A canonical-dialect statement with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    text: String,
    kind: StatementKind,
    returning: Option<String>,
}

impl Statement {
    /// Classify canonical SQL text.
    pub fn parse(text: impl Into<String>) -> Result<Self, DbError> {
        let text = text.into();
        let keyword = leading_keyword(&text)
            .ok_or_else(|| DbError::Translation("empty statement".into()))?;

        let kind = match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" => StatementKind::Select,
            "INSERT" => StatementKind::Insert { table: capture_table(&INSERT_TABLE, &text)? },
            "UPDATE" => StatementKind::Update { table: capture_table(&UPDATE_TABLE, &text)? },
            "DELETE" => StatementKind::Delete { table: capture_table(&DELETE_TABLE, &text)? },
            _ => StatementKind::Other,
        };

        let returning = find_keyword(&text, "RETURNING")
            .map(|at| {
                text[at + "RETURNING".len()..]
                    .trim()
                    .trim_end_matches(';')
                    .trim_end()
                    .to_string()
            })
            .filter(|cols| !cols.is_empty());

        Ok(Self { text, kind, returning })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    /// Column list of a `RETURNING` clause, if the statement had one.
    #[must_use]
    pub fn returning(&self) -> Option<&str> {
        self.returning.as_deref()
    }
}

impl TryFrom<&str> for Statement {
    type Error = DbError;

    fn try_from(text: &str) -> Result<Self, Self::Error> {
        Self::parse(text)
    }
}

impl TryFrom<String> for Statement {
    type Error = DbError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(text)
    }
}

fn leading_keyword(text: &str) -> Option<String> {
    let trimmed = text.trim_start().trim_start_matches('(').trim_start();
    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

fn capture_table(re: &Regex, text: &str) -> Result<String, DbError> {
    re.captures(text)
        .map(|c| c[1].trim_matches('"').to_string())
        .ok_or_else(|| DbError::Translation(format!("cannot find target table in: {}", text.trim())))
}

/// Translate canonical SQL into the fallback engine's dialect.
pub fn translate(sql: &str) -> Result<String, DbError> {
    let adapted = rewrite_placeholders(sql)?;
    let adapted = TIMESTAMP_FN.replace_all(&adapted, "datetime('now')");
    let adapted: &str = &adapted;
    let adapted = match find_keyword(adapted, "RETURNING") {
        Some(at) => &adapted[..at],
        None => adapted,
    };
    let adapted = SERIAL_COLUMN.replace_all(adapted, "INTEGER PRIMARY KEY AUTOINCREMENT");
    Ok(adapted.trim().to_string())
}

/// `$N` → `?N`, skipping quoted literals and identifiers.
fn rewrite_placeholders(sql: &str) -> Result<String, DbError> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$'
                && chars.peek().is_some_and(char::is_ascii_digit)
                && !prev.is_some_and(|p| p.is_alphanumeric() || p == '_') =>
            {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                if digits.parse::<u32>().map_or(true, |n| n == 0) {
                    return Err(DbError::Translation(format!("invalid placeholder ${digits}")));
                }
                out.push('?');
                out.push_str(&digits);
                prev = digits.chars().last();
                continue;
            }
            None => out.push(c),
        }
        prev = Some(c);
    }

    if quote.is_some() {
        return Err(DbError::Translation("unterminated quoted literal".into()));
    }
    Ok(out)
}

/// Byte offset of `keyword` as a whole word at the top level of `sql`:
/// outside quoted text and outside parentheses.
fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let word = keyword.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => {
                let end = i + word.len();
                if end <= bytes.len()
                    && bytes[i..end].eq_ignore_ascii_case(word)
                    && (i == 0 || !is_word(bytes[i - 1]))
                    && bytes.get(end).map_or(true, |&next| !is_word(next))
                {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Add `column = 0` to the SET list of an UPDATE, unless that list already
/// assigns it. The WHERE clause is not consulted.
pub(crate) fn with_assignment(sql: &str, column: &str) -> String {
    let Some(set) = UPDATE_SET.captures(sql).and_then(|c| c.get(1)) else {
        return sql.to_string();
    };
    let tail = &sql[set.end()..];
    let assignments = find_keyword(tail, "WHERE").map_or(tail, |at| &tail[..at]);

    let assigns = Regex::new(&format!(r"(?i)(?:^|,)\s*\b{}\s*=", regex::escape(column)))
        .map(|re| re.is_match(assignments))
        .unwrap_or(false);
    if assigns {
        return sql.to_string();
    }
    format!("{}{column} = 0, {tail}", set.as_str())
}
