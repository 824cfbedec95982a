//! Rewriting structure definitions for another table name.

use crate::Result;
use crate::error::ReplicationError;
use crate::sql::quote_mysql;
use regex::Regex;
use std::sync::OnceLock;

fn create_table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let identifier = r#"(?:`(?:[^`]|``)+`|"(?:[^"]|"")+"|[\w$]+)"#;
        let pattern = format!(
            r"(?is)^\s*CREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?P<name>{id}(?:\s*\.\s*{id})?)",
            id = identifier
        );
        match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(e) => unreachable!("invalid built-in pattern: {}", e),
        }
    })
}

/// Rewrites a `CREATE TABLE` statement to create `target_table` instead.
///
/// Any database qualifier on the original name is dropped, whether or not
/// the name was quoted.
///
/// # Errors
/// Returns [`ReplicationError::InvalidStatement`] when the text is not a
/// `CREATE TABLE` statement.
///
/// # Example
/// ```rust
/// use tablesync_core::schema::adapt_create_statement;
///
/// let adapted = adapt_create_statement(
///     "CREATE TABLE `clinic`.`patient` (`id` int NOT NULL)",
///     "patient_copy",
/// ).unwrap();
/// assert_eq!(adapted, "CREATE TABLE `patient_copy` (`id` int NOT NULL)");
/// ```
pub fn adapt_create_statement(create_statement: &str, target_table: &str) -> Result<String> {
    if target_table.is_empty() {
        return Err(ReplicationError::invalid_statement(
            "target table name cannot be empty",
        ));
    }

    let captures = create_table_pattern()
        .captures(create_statement)
        .ok_or_else(|| {
            let preview: String = create_statement.trim().chars().take(40).collect();
            ReplicationError::invalid_statement(format!(
                "expected a CREATE TABLE statement, got '{}'",
                preview
            ))
        })?;
    let Some(name) = captures.name("name") else {
        return Err(ReplicationError::invalid_statement(
            "CREATE TABLE statement has no table name",
        ));
    };

    Ok(format!(
        "{}{}{}",
        create_statement[..name.start()].trim_start(),
        quote_mysql(target_table),
        &create_statement[name.end()..]
    ))
}
