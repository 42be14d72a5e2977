//! Rendering command results as tables or JSON

use crate::cli::OutputFormat;
use anyhow::Result;
use comfy_table::{Cell, Table};
use rusqlite::types::ValueRef;
use serde::Serialize;
use serde_json::Value;

/// Rows returned by a query, already converted to JSON values
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&self.as_objects())?),
            OutputFormat::Table => {
                let mut table = Table::new();
                table.set_header(self.columns.iter().map(Cell::new));
                for row in &self.rows {
                    table.add_row(row.iter().map(|value| Cell::new(display_value(value))));
                }
                Ok(format!("{}\n({} rows)", table, self.rows.len()))
            }
        }
    }

    fn as_objects(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Convert one SQLite value to JSON; blobs become their length
pub fn sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::from(format!("<{} bytes>", bytes.len())),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Two-column key/value table, or the serialized value as JSON
pub fn render_pairs<T: Serialize>(
    pairs: &[(&str, String)],
    value: &T,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_header(vec!["Property", "Value"]);
            for (key, value) in pairs {
                table.add_row(vec![Cell::new(key), Cell::new(value)]);
            }
            Ok(table.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QueryOutput {
        QueryOutput {
            columns: vec!["id".to_string(), "label".to_string(), "graph".to_string()],
            rows: vec![
                vec![json!(1), json!("alpha"), json!(0)],
                vec![json!(4), json!("epsilon"), Value::Null],
            ],
        }
    }

    #[test]
    fn test_sql_value_conversion() {
        assert_eq!(sql_value(ValueRef::Null), Value::Null);
        assert_eq!(sql_value(ValueRef::Integer(7)), json!(7));
        assert_eq!(sql_value(ValueRef::Text(b"x")), json!("x"));
        assert_eq!(sql_value(ValueRef::Blob(&[1, 2, 3])), json!("<3 bytes>"));
    }

    #[test]
    fn test_json_rows_are_objects() {
        let rendered = sample().render(OutputFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["label"], json!("alpha"));
        assert_eq!(parsed[1]["graph"], Value::Null);
    }

    #[test]
    fn test_table_output() {
        let rendered = sample().render(OutputFormat::Table).unwrap();
        assert!(rendered.contains("epsilon"));
        assert!(rendered.contains("NULL"));
        assert!(rendered.ends_with("(2 rows)"));
    }
}
