//! Statement building helpers.
//!
//! Identifiers cannot be bound as parameters, so every query-building path
//! interpolates them through [`quote_mysql`] or [`quote_pg`]. Values are always
//! bound through [`Statement::params`].

use crate::value::CellValue;

/// Largest number of bind parameters a single statement may carry.
///
/// Both MySQL and PostgreSQL encode the parameter count as a 16-bit value.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Quotes a MySQL identifier with backticks.
///
/// # Example
/// ```rust
/// use tablesync_core::sql::quote_mysql;
///
/// assert_eq!(quote_mysql("patient"), "`patient`");
/// assert_eq!(quote_mysql("odd`name"), "`odd``name`");
/// ```
pub fn quote_mysql(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Quotes a PostgreSQL identifier with double quotes.
pub fn quote_pg(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// SQL dialect a statement is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// MySQL (source and replication copy)
    MySql,
    /// PostgreSQL (analytics store)
    Postgres,
}

impl Dialect {
    /// Quotes an identifier for this dialect.
    pub fn quote(self, identifier: &str) -> String {
        match self {
            Self::MySql => quote_mysql(identifier),
            Self::Postgres => quote_pg(identifier),
        }
    }

    /// Placeholder for the `position`-th parameter (1-based).
    pub fn placeholder(self, position: usize) -> String {
        match self {
            Self::MySql => "?".to_string(),
            Self::Postgres => format!("${}", position),
        }
    }

    /// Comma-separated quoted column list.
    pub fn column_list(self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `schema.table` for PostgreSQL, `table` for MySQL.
    pub fn table_ref(self, schema: Option<&str>, table: &str) -> String {
        match (self, schema) {
            (Self::Postgres, Some(schema)) => {
                format!("{}.{}", quote_pg(schema), quote_pg(table))
            }
            _ => self.quote(table),
        }
    }
}

/// A SQL text with its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with dialect placeholders
    pub sql: String,
    /// Values bound in placeholder order
    pub params: Vec<CellValue>,
}

impl Statement {
    /// Creates a statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a statement with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<CellValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Appends one bound value.
    pub fn bind(mut self, value: impl Into<CellValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Parameter values may contain row data; only the count is shown.
        write!(f, "{} [{} params]", self.sql, self.params.len())
    }
}

/// Builds multi-row INSERT statements for `rows`.
///
/// `table` must already be quoted (see [`Dialect::table_ref`]). Rows are split
/// across statements so that no statement carries more than `max_rows` rows
/// or exceeds [`MAX_BIND_PARAMS`]. The optional `suffix` (for example an
/// `ON CONFLICT` clause) is appended to every statement.
pub fn insert_statements(
    dialect: Dialect,
    table: &str,
    columns: &[String],
    rows: Vec<Vec<CellValue>>,
    max_rows: usize,
    suffix: Option<&str>,
) -> Vec<Statement> {
    if columns.is_empty() || rows.is_empty() {
        return Vec::new();
    }

    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).clamp(1, max_rows.max(1));
    let prefix = format!(
        "INSERT INTO {} ({}) VALUES ",
        table,
        dialect.column_list(columns)
    );

    let mut statements = Vec::with_capacity(rows.len().div_ceil(rows_per_statement));
    let mut rows = rows.into_iter().peekable();

    while rows.peek().is_some() {
        let mut sql = prefix.clone();
        let mut params = Vec::with_capacity(rows_per_statement * columns.len());

        for (row_index, row) in rows.by_ref().take(rows_per_statement).enumerate() {
            if row_index > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for (column_index, value) in row.into_iter().enumerate() {
                if column_index > 0 {
                    sql.push_str(", ");
                }
                params.push(value);
                sql.push_str(&dialect.placeholder(params.len()));
            }
            sql.push(')');
        }

        if let Some(suffix) = suffix {
            sql.push(' ');
            sql.push_str(suffix);
        }

        statements.push(Statement::with_params(sql, params));
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting_escapes_quote_characters() {
        assert_eq!(quote_pg("patient"), "\"patient\"");
        assert_eq!(quote_pg("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(Dialect::MySql.quote("a`b"), "`a``b`");
    }

    #[test]
    fn test_table_ref() {
        assert_eq!(
            Dialect::Postgres.table_ref(Some("public"), "patient"),
            "\"public\".\"patient\""
        );
        assert_eq!(Dialect::MySql.table_ref(Some("ignored"), "patient"), "`patient`");
    }

    #[test]
    fn test_insert_statement_placeholders() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![CellValue::Int(1), CellValue::Text("a".into())],
            vec![CellValue::Int(2), CellValue::Null],
        ];

        let statements = insert_statements(
            Dialect::Postgres,
            "\"public\".\"patient\"",
            &columns,
            rows.clone(),
            1_000,
            Some("ON CONFLICT DO NOTHING"),
        );
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO \"public\".\"patient\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4) ON CONFLICT DO NOTHING"
        );
        assert_eq!(statements[0].params.len(), 4);

        let statements = insert_statements(Dialect::MySql, "`patient`", &columns, rows, 1_000, None);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO `patient` (`id`, `name`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn test_insert_statements_split_at_parameter_limit() {
        let columns: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        let row = vec![CellValue::Int(0); 10];
        let rows = vec![row; 7_000];

        let statements = insert_statements(Dialect::Postgres, "t", &columns, rows, usize::MAX, None);

        // 6,553 rows fit into 65,535 parameters
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 65_530);
        assert_eq!(statements[1].params.len(), 4_470);
        assert!(statements[1].sql.contains("($1, $2"));
        assert!(statements.iter().all(|s| s.params.len() <= MAX_BIND_PARAMS));
    }

    #[test]
    fn test_insert_statements_row_cap() {
        let columns = vec!["id".to_string()];
        let rows: Vec<Vec<CellValue>> = (0..25).map(|i| vec![CellValue::Int(i)]).collect();
        let statements = insert_statements(Dialect::MySql, "`t`", &columns, rows, 10, None);
        let sizes: Vec<usize> = statements.iter().map(|s| s.params.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_insert_statements_empty_input() {
        let columns = vec!["id".to_string()];
        assert!(insert_statements(Dialect::MySql, "t", &columns, Vec::new(), 10, None).is_empty());
        assert!(insert_statements(Dialect::MySql, "t", &[], vec![vec![]], 10, None).is_empty());
    }
}
