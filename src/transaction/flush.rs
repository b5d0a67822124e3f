//! Turns a buffered transaction into parameterised statements.
//!
//! Statements run in three phases: inserts in submission order, one UPDATE
//! per edited row, then deletes. Every parameter is sent as text (bytes stay
//! bytes) and cast to the column's declared type, so the server performs the
//! conversion exactly as it would for a literal.

use std::collections::BTreeMap;

use crate::db::Statement;
use crate::error::{Result, WorkbenchError};
use crate::models::{CellEdit, RowInsert, TableMetadata, TransactionState, Value};
use crate::sql::{qualified_name, quote_ident};

/// Encodes primary-key parts as a row key: the bare text for one key
/// column, a JSON array of strings for composite keys.
pub fn encode_row_key(parts: &[String]) -> String {
    match parts {
        [single] => single.clone(),
        _ => serde_json::to_string(parts).unwrap_or_default(),
    }
}

pub fn decode_row_key(table: &TableMetadata, row_key: &str) -> Result<Vec<String>> {
    match table.primary_keys.len() {
        0 => Err(WorkbenchError::InputInvalid(format!(
            "table {} has no primary key; rows cannot be addressed",
            table.table_ref()
        ))),
        1 => Ok(vec![row_key.to_string()]),
        n => {
            let parts: Vec<String> = serde_json::from_str(row_key).map_err(|_| {
                WorkbenchError::InputInvalid(format!("row key {row_key:?} is not a JSON array of {n} strings"))
            })?;
            if parts.len() != n {
                return Err(WorkbenchError::InputInvalid(format!(
                    "row key {row_key:?} has {} parts, table has {n} key columns",
                    parts.len()
                )));
            }
            Ok(parts)
        }
    }
}

pub fn plan(state: &TransactionState, table: &TableMetadata) -> Result<Vec<Statement>> {
    let target = qualified_name(&table.schema, &table.name);
    let mut statements = Vec::new();

    for insert in &state.pending_inserts {
        statements.push(insert_statement(&target, table, insert)?);
    }

    for (row_key, cells) in &state.pending_edits {
        // the delete subsumes any edit to the same row
        if state.pending_deletes.contains(row_key) || cells.is_empty() {
            continue;
        }
        statements.push(update_statement(&target, table, row_key, cells)?);
    }

    for row_key in &state.pending_deletes {
        let mut statement = Statement::new(String::new());
        let predicate = key_predicate(&mut statement, table, row_key)?;
        statement.sql = format!("DELETE FROM {target} WHERE {predicate}");
        statements.push(statement);
    }

    Ok(statements)
}

fn insert_statement(target: &str, table: &TableMetadata, insert: &RowInsert) -> Result<Statement> {
    if insert.values.is_empty() {
        return Ok(Statement::new(format!("INSERT INTO {target} DEFAULT VALUES")));
    }

    let mut statement = Statement::new(String::new());
    let mut columns = Vec::with_capacity(insert.values.len());
    let mut placeholders = Vec::with_capacity(insert.values.len());
    for (column, value) in &insert.values {
        placeholders.push(cast_placeholder(&mut statement, table, column, value)?);
        columns.push(quote_ident(column));
    }
    statement.sql = format!(
        "INSERT INTO {target} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok(statement)
}

fn update_statement(
    target: &str,
    table: &TableMetadata,
    row_key: &str,
    cells: &BTreeMap<String, CellEdit>,
) -> Result<Statement> {
    let mut statement = Statement::new(String::new());
    let mut assignments = Vec::with_capacity(cells.len());
    for (column, cell) in cells {
        let placeholder = cast_placeholder(&mut statement, table, column, &cell.new_value)?;
        assignments.push(format!("{} = {placeholder}", quote_ident(column)));
    }
    let predicate = key_predicate(&mut statement, table, row_key)?;
    statement.sql = format!("UPDATE {target} SET {} WHERE {predicate}", assignments.join(", "));
    Ok(statement)
}

fn key_predicate(statement: &mut Statement, table: &TableMetadata, row_key: &str) -> Result<String> {
    let parts = decode_row_key(table, row_key)?;
    let mut clauses = Vec::with_capacity(parts.len());
    for (column, part) in table.primary_keys.iter().zip(parts) {
        let placeholder = cast_placeholder(statement, table, column, &Value::Text(part))?;
        clauses.push(format!("{} = {placeholder}", quote_ident(column)));
    }
    Ok(clauses.join(" AND "))
}

fn cast_placeholder(statement: &mut Statement, table: &TableMetadata, column: &str, value: &Value) -> Result<String> {
    let meta = table.column(column).ok_or_else(|| {
        WorkbenchError::InputInvalid(format!("column {column:?} does not exist on {}", table.table_ref()))
    })?;
    let placeholder = format!("{}::{}", statement.next_placeholder(), meta.sql_type);
    statement.params.push(as_text_param(value));
    Ok(placeholder)
}

fn as_text_param(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bytes(bytes) => Value::Bytes(bytes.clone()),
        Value::Text(text) => Value::Text(text.clone()),
        other => other.to_text().map_or(Value::Null, Value::Text),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::{ColumnMetadata, RowEdit, TableRef};

    fn column(name: &str, sql_type: &str, is_primary: bool) -> ColumnMetadata {
        ColumnMetadata {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: !is_primary,
            is_primary,
        }
    }

    fn users() -> TableMetadata {
        TableMetadata {
            schema: "public".into(),
            name: "users".into(),
            columns: vec![
                column("id", "integer", true),
                column("name", "text", false),
                column("email", "character varying(255)", false),
            ],
            primary_keys: vec!["id".into()],
            foreign_keys: Vec::new(),
        }
    }

    fn state() -> TransactionState {
        let now = Utc::now();
        TransactionState::new("alice", "testdb", TableRef::new("public", "users"), now, now + Duration::minutes(5))
    }

    fn edit(row: &str, column: &str, new: &str) -> RowEdit {
        RowEdit {
            row_index: row.into(),
            column: column.into(),
            old_value: Value::Null,
            new_value: new.into(),
        }
    }

    #[test]
    fn phases_run_inserts_updates_then_deletes() {
        let mut s = state();
        s.record_delete("3".into());
        s.record_edit(edit("1", "name", "Alicia"));
        s.record_edit(edit("1", "email", "a@example.com"));
        s.record_insert(RowInsert::new().with("name", "Dave").with("id", 5_i64));

        let plan = plan(&s, &users()).unwrap();
        let sql: Vec<_> = plan.iter().map(|st| st.sql.as_str()).collect();
        assert_eq!(
            sql,
            [
                r#"INSERT INTO "public"."users" ("id", "name") VALUES ($1::integer, $2::text)"#,
                r#"UPDATE "public"."users" SET "email" = $1::character varying(255), "name" = $2::text WHERE "id" = $3::integer"#,
                r#"DELETE FROM "public"."users" WHERE "id" = $1::integer"#,
            ]
        );
        assert_eq!(plan[0].params, vec![Value::from("5"), Value::from("Dave")]);
        assert_eq!(
            plan[1].params,
            vec![Value::from("a@example.com"), Value::from("Alicia"), Value::from("1")]
        );
        assert_eq!(plan[2].params, vec![Value::from("3")]);
    }

    #[test]
    fn edits_on_deleted_rows_are_dropped() {
        let mut s = state();
        s.record_edit(edit("2", "name", "gone"));
        s.record_delete("2".into());
        let plan = plan(&s, &users()).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].sql.starts_with("DELETE"));
    }

    #[test]
    fn empty_insert_uses_defaults() {
        let mut s = state();
        s.record_insert(RowInsert::new());
        let plan = plan(&s, &users()).unwrap();
        assert_eq!(plan[0].sql, r#"INSERT INTO "public"."users" DEFAULT VALUES"#);
        assert!(plan[0].params.is_empty());
    }

    #[test]
    fn unknown_columns_and_keyless_tables_are_rejected() {
        let mut s = state();
        s.record_edit(edit("1", "nickname", "Al"));
        assert!(matches!(plan(&s, &users()), Err(WorkbenchError::InputInvalid(_))));

        let mut keyless = users();
        keyless.primary_keys.clear();
        let mut s = state();
        s.record_delete("1".into());
        assert!(matches!(plan(&s, &keyless), Err(WorkbenchError::InputInvalid(_))));

        let mut s = state();
        s.record_insert(RowInsert::new().with("name", "ok"));
        assert_eq!(plan(&s, &keyless).unwrap().len(), 1);
    }

    #[test]
    fn composite_keys_are_json_arrays() {
        let mut table = users();
        table.columns.push(column("tenant", "uuid", true));
        table.primary_keys = vec!["tenant".into(), "id".into()];
        let key = encode_row_key(&["t-1".to_string(), "7".to_string()]);
        assert_eq!(key, r#"["t-1","7"]"#);

        let mut s = state();
        s.record_delete(key);
        let plan = plan(&s, &table).unwrap();
        assert_eq!(
            plan[0].sql,
            r#"DELETE FROM "public"."users" WHERE "tenant" = $1::uuid AND "id" = $2::integer"#
        );
        assert!(decode_row_key(&table, "7").is_err());
        assert!(decode_row_key(&table, r#"["only-one"]"#).is_err());
    }

    #[test]
    fn nulls_stay_null() {
        let mut s = state();
        s.record_edit(RowEdit {
            row_index: "1".into(),
            column: "email".into(),
            old_value: "x@example.com".into(),
            new_value: Value::Null,
        });
        let plan = plan(&s, &users()).unwrap();
        assert_eq!(plan[0].params[0], Value::Null);
    }
}
