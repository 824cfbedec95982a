//! Structure fingerprints.
//!
//! A fingerprint is the SHA-256 (lower-case hex) of the `SHOW CREATE TABLE`
//! text after normalization. Normalization applies, in order:
//!
//! 1. `AUTO_INCREMENT=<n>` table options are replaced with a constant.
//! 2. Engine, charset, collation, row-format, key-block-size and comment
//!    annotations are removed.
//! 3. Backticks and double quotes are removed.
//! 4. Whitespace runs collapse to one space.
//! 5. Column definitions are sorted by text, followed by the remaining index
//!    and constraint clauses (sorted), with the primary-key clause last.
//!
//! Stored hashes depend on these exact rules.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const AUTO_INCREMENT_CONSTANT: &str = "AUTO_INCREMENT=0";

struct Patterns {
    auto_increment: Regex,
    annotations: Vec<Regex>,
    whitespace: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |pattern: &str| match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => unreachable!("invalid built-in pattern {}: {}", pattern, e),
        };
        Patterns {
            auto_increment: compile(r"(?i)\bAUTO_INCREMENT\s*=\s*\d+"),
            annotations: vec![
                compile(r"(?i)\bENGINE\s*=\s*\w+"),
                compile(r"(?i)\b(?:DEFAULT\s+)?(?:CHARSET|CHARACTER\s+SET)\s*=?\s*\w+"),
                compile(r"(?i)\b(?:DEFAULT\s+)?COLLATE\s*=?\s*\w+"),
                compile(r"(?i)\bROW_FORMAT\s*=\s*\w+"),
                compile(r"(?i)\bKEY_BLOCK_SIZE\s*=\s*\d+"),
                compile(r"(?i)\bCOMMENT\s*=?\s*'(?:[^'\\]|\\.|'')*'"),
            ],
            whitespace: compile(r"\s+"),
        }
    })
}

/// Normalizes structure text for hashing.
///
/// # Example
/// ```rust
/// use tablesync_core::schema::normalize_create_statement;
///
/// let a = normalize_create_statement(
///     "CREATE TABLE `t` (\n  `b` int,\n  `a` int\n) ENGINE=InnoDB AUTO_INCREMENT=42",
/// );
/// let b = normalize_create_statement(
///     "CREATE TABLE `t` (`a` int, `b` int) ENGINE=MyISAM AUTO_INCREMENT=7",
/// );
/// assert_eq!(a, b);
/// ```
pub fn normalize_create_statement(create_statement: &str) -> String {
    let patterns = patterns();

    let mut text = patterns
        .auto_increment
        .replace_all(create_statement, AUTO_INCREMENT_CONSTANT)
        .into_owned();
    for annotation in &patterns.annotations {
        text = annotation.replace_all(&text, " ").into_owned();
    }
    text.retain(|c| c != '`' && c != '"');
    let text = patterns
        .whitespace
        .replace_all(text.trim(), " ")
        .trim_end_matches(';')
        .trim()
        .to_string();

    sort_definitions(&text)
}

/// Computes the fingerprint of structure text.
pub fn compute_fingerprint(create_statement: &str) -> String {
    let normalized = normalize_create_statement(create_statement);
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClauseKind {
    Column,
    Constraint,
    PrimaryKey,
}

const CONSTRAINT_PREFIXES: &[&str] = &[
    "KEY ",
    "INDEX ",
    "UNIQUE ",
    "CONSTRAINT ",
    "FOREIGN KEY",
    "FULLTEXT ",
    "SPATIAL ",
    "CHECK ",
];

fn clause_kind(clause: &str) -> ClauseKind {
    let upper = clause.to_uppercase();
    if upper.starts_with("PRIMARY KEY") {
        ClauseKind::PrimaryKey
    } else if CONSTRAINT_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        ClauseKind::Constraint
    } else {
        ClauseKind::Column
    }
}

fn sort_definitions(text: &str) -> String {
    let Some(open) = text.find('(') else {
        return text.to_string();
    };
    let Some(close) = matching_paren(text, open) else {
        return text.to_string();
    };

    let mut clauses: Vec<(ClauseKind, &str)> = split_top_level(&text[open + 1..close])
        .into_iter()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| (clause_kind(c), c))
        .collect();
    clauses.sort();

    let body = clauses
        .iter()
        .map(|(_, clause)| *clause)
        .collect::<Vec<_>>()
        .join(", ");
    let head = text[..open].trim_end();
    let tail = text[close + 1..].trim();

    if tail.is_empty() {
        format!("{} ({})", head, body)
    } else {
        format!("{} ({}) {}", head, body, tail)
    }
}

/// Byte offset of the parenthesis closing the one at `open`.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;

    for (offset, c) in text[open..].char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits at commas outside parentheses and string literals.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;

    for (offset, c) in body.char_indices() {
        if in_quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_quote = false,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..offset]);
                start = offset + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}
