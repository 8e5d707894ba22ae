//! SQL text helpers for dynamically named tables

use crate::ingestion::TableSchema;

/// Quote an identifier so header names are used verbatim.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for statements that do not accept bind parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `CREATE TABLE` statement for a header-derived schema.
///
/// No `IF NOT EXISTS`: a concurrent creator surfaces as SQLSTATE 42P07,
/// which the caller maps to "already exists".
pub fn create_table_ddl(schema: &TableSchema) -> String {
    let mut parts: Vec<String> = schema
        .columns
        .iter()
        .map(|col| {
            let null = if col.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(&col.name), col.data_type, null)
        })
        .collect();

    let pk = schema.primary_key();
    if !pk.is_empty() {
        let cols: Vec<String> = pk.iter().map(|c| quote_ident(c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }

    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_ident(&schema.table_name),
        parts.join(",\n  ")
    )
}

/// `COMMENT ON TABLE` statement, if the schema has a description.
pub fn comment_ddl(schema: &TableSchema) -> Option<String> {
    schema.description.as_ref().map(|d| {
        format!(
            "COMMENT ON TABLE {} IS {}",
            quote_ident(&schema.table_name),
            quote_literal(d)
        )
    })
}
