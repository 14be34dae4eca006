//! SQL text generation for the PostgreSQL stores.
//!
//! Identifiers cannot be bound as parameters, and record values arrive as
//! untyped JSON, so statements are rendered with quoted identifiers and
//! literal values. Quoted literals are left untyped so PostgreSQL coerces
//! them to the column type on assignment.

use crate::core::Row;
use crate::error::{MigrateError, Result};
use serde_json::Value;

/// Maximum identifier length accepted by PostgreSQL.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Reject empty, oversized or NUL-containing identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".into()));
    }
    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds {} bytes: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }
    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `"schema"."table"`.
pub fn qualify(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Array text form, e.g. `{1,2,"a b",NULL}`.
fn array_text(items: &[Value]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Value::Array(inner) => array_text(inner),
            Value::Object(_) => {
                let json = item.to_string();
                format!("\"{}\"", json.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// Render a JSON value as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", escape_sql_string(s)),
        Value::Array(items) => format!("'{}'", escape_sql_string(&array_text(items))),
        Value::Object(_) => format!("'{}'", escape_sql_string(&value.to_string())),
    }
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

/// Render a JSON value as one COPY text field (`\N` for null, `t`/`f` for booleans).
pub fn copy_text(value: &Value) -> String {
    match value {
        Value::Null => "\\N".to_string(),
        Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_copy_text(s),
        Value::Array(items) => escape_copy_text(&array_text(items)),
        Value::Object(_) => escape_copy_text(&value.to_string()),
    }
}

fn where_clause(filter: &Row) -> Result<String> {
    if filter.is_empty() {
        return Err(MigrateError::Validation(
            "refusing to build a statement without a filter".into(),
        ));
    }
    let parts = filter
        .iter()
        .map(|(col, val)| {
            let col = quote_ident(col)?;
            Ok(match val {
                Value::Null => format!("{} IS NULL", col),
                _ => format!("{} = {}", col, literal(val)),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(" AND "))
}

/// `INSERT INTO t (cols) VALUES (lits) [RETURNING col]`.
pub fn insert(schema: &str, table: &str, row: &Row, returning: Option<&str>) -> Result<String> {
    let target = qualify(schema, table)?;
    let mut sql = if row.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", target)
    } else {
        let cols = row
            .keys()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let vals: Vec<String> = row.values().map(literal).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target,
            cols.join(", "),
            vals.join(", ")
        )
    };
    if let Some(col) = returning {
        sql.push_str(&format!(" RETURNING {}", quote_ident(col)?));
    }
    Ok(sql)
}

/// `UPDATE t SET col = lit, ... WHERE filter`.
pub fn update(schema: &str, table: &str, filter: &Row, fields: &Row) -> Result<String> {
    if fields.is_empty() {
        return Err(MigrateError::Validation(format!(
            "update of {} has no fields",
            table
        )));
    }
    let sets = fields
        .iter()
        .map(|(col, val)| Ok(format!("{} = {}", quote_ident(col)?, literal(val))))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        qualify(schema, table)?,
        sets.join(", "),
        where_clause(filter)?
    ))
}

/// `SELECT col::bigint FROM t WHERE filter ORDER BY col`.
pub fn select_i64(schema: &str, table: &str, column: &str, filter: &Row) -> Result<String> {
    let col = quote_ident(column)?;
    Ok(format!(
        "SELECT {col}::bigint FROM {} WHERE {} ORDER BY {col}",
        qualify(schema, table)?,
        where_clause(filter)?,
    ))
}

/// `COPY t (cols) FROM STDIN WITH (FORMAT TEXT, NULL '\N')`.
pub fn copy_in(schema: &str, table: &str, columns: &[String]) -> Result<String> {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT, NULL '\\N')",
        qualify(schema, table)?,
        cols.join(", ")
    ))
}

/// `ALTER TABLE t ENABLE|DISABLE TRIGGER name`.
pub fn set_trigger(schema: &str, table: &str, trigger: &str, enabled: bool) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} {} TRIGGER {}",
        qualify(schema, table)?,
        if enabled { "ENABLE" } else { "DISABLE" },
        quote_ident(trigger)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::row;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("order").unwrap(), "\"order\"");
        assert_eq!(quote_ident("a\"b").unwrap(), "\"a\"\"b\"");
        assert!(quote_ident("").is_err());
        assert!(quote_ident("bad\0name").is_err());
        assert!(quote_ident(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&json!(true)), "TRUE");
        assert_eq!(literal(&json!(42)), "42");
        assert_eq!(literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(literal(&json!([1, 2, 3])), "'{1,2,3}'");
        assert_eq!(literal(&json!([])), "'{}'");
        assert_eq!(literal(&json!(["a b", "it's"])), "'{\"a b\",\"it''s\"}'");
    }

    #[test]
    fn test_copy_text() {
        assert_eq!(copy_text(&Value::Null), "\\N");
        assert_eq!(copy_text(&json!(false)), "f");
        assert_eq!(copy_text(&json!("a\tb\nc\\")), "a\\tb\\nc\\\\");
        assert_eq!(copy_text(&json!(17)), "17");
    }

    #[test]
    fn test_insert_with_returning() {
        let r = row([("user_id", json!(3)), ("topic_ids", json!([-1]))]);
        let sql = insert("public", "user_tests", &r, Some("id")).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"user_tests\" (\"topic_ids\", \"user_id\") VALUES ('{-1}', 3) RETURNING \"id\""
        );
    }

    #[test]
    fn test_update_targets_filter() {
        let filter = row([("question_id", json!(7)), ("option_order", json!(2))]);
        let fields = row([("answer", json!("Madrid")), ("is_correct", json!(true))]);
        let sql = update("public", "question_options", &filter, &fields).unwrap();
        assert!(sql.starts_with("UPDATE \"public\".\"question_options\" SET"));
        assert!(sql.contains("\"answer\" = 'Madrid'"));
        assert!(sql.contains("WHERE \"option_order\" = 2 AND \"question_id\" = 7"));
    }

    #[test]
    fn test_update_without_filter_refused() {
        let fields = row([("finalized", json!(true))]);
        assert!(update("public", "user_tests", &Row::new(), &fields).is_err());
    }

    #[test]
    fn test_copy_statement() {
        let cols = vec!["user_test_id".to_string(), "question_id".to_string()];
        assert_eq!(
            copy_in("public", "user_test_answers", &cols).unwrap(),
            "COPY \"public\".\"user_test_answers\" (\"user_test_id\", \"question_id\") FROM STDIN WITH (FORMAT TEXT, NULL '\\N')"
        );
    }

    #[test]
    fn test_trigger_statement() {
        assert_eq!(
            set_trigger("public", "user_tests", "trigger_update_daily_activity_and_streak", false)
                .unwrap(),
            "ALTER TABLE \"public\".\"user_tests\" DISABLE TRIGGER \"trigger_update_daily_activity_and_streak\""
        );
    }
}
