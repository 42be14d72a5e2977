use anyhow::Result;
use sparqlite_store::{Connection, DatabaseManager, OpenOptions, StatementKind, StoreConfig, StoreResult};

use crate::cli::OutputFormat;
use crate::commands::open_store;
use crate::output::{sql_value, QueryOutput};

/// Run `sql` and collect every row
pub fn collect(conn: &mut Connection, sql: &str) -> StoreResult<QueryOutput> {
    let mut stmt = conn.prepare(StatementKind::Select, sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut output = QueryOutput::new(columns);

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(sql_value(row.get_ref(i)?));
        }
        output.rows.push(values);
    }
    Ok(output)
}

/// Run `f` on the connection commands use: the writer, or a reader when
/// the store is read-only
fn with_connection<F, T>(manager: &DatabaseManager, f: F) -> StoreResult<T>
where
    F: FnOnce(&mut Connection) -> StoreResult<T>,
{
    if manager.is_read_only() {
        manager.with_read(f)
    } else {
        manager.with_write(f)
    }
}

fn attach_graphs(manager: &DatabaseManager, conn: &mut Connection, graphs: &[String]) -> StoreResult<()> {
    for graph in graphs {
        if !conn.is_attached(graph) {
            manager.attach_database(conn, graph, false)?;
        }
    }
    Ok(())
}

pub fn execute(
    config: StoreConfig,
    options: OpenOptions,
    sql: &str,
    graphs: &[String],
    format: OutputFormat,
) -> Result<()> {
    let manager = open_store(config, options)?;
    let output = with_connection(&manager, |conn| {
        attach_graphs(&manager, conn, graphs)?;
        collect(conn, sql)
    })?;

    println!("{}", output.render(format)?);
    Ok(())
}

/// Name of the federated table created for `table`
pub fn union_table_name(table: &str) -> String {
    format!("union_{}", table)
}

pub fn union(
    config: StoreConfig,
    options: OpenOptions,
    table: &str,
    graphs: &[String],
    format: OutputFormat,
) -> Result<()> {
    let manager = open_store(config, options)?;
    let federated = union_table_name(table);
    let output = with_connection(&manager, |conn| {
        attach_graphs(&manager, conn, graphs)?;
        conn.create_federated_table(&federated, table)?;
        collect(
            conn,
            &format!("SELECT * FROM temp.\"{}\"", federated.replace('"', "\"\"")),
        )
    })?;

    println!("{}", output.render(format)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sparqlite_store::NoopObserver;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_collect_converts_rows() {
        let dir = TempDir::new().unwrap();
        let manager = DatabaseManager::open(
            StoreConfig::new(dir.path()),
            OpenOptions::read_write(),
            Arc::new(NoopObserver),
        )
        .unwrap();

        let output = manager
            .with_write(|conn| {
                conn.execute_batch(
                    "CREATE TABLE Items (id INTEGER, label TEXT);
                     INSERT INTO Items VALUES (1, 'alpha'), (2, NULL);",
                )?;
                collect(conn, "SELECT id, label FROM Items ORDER BY id")
            })
            .unwrap();

        assert_eq!(output.columns, vec!["id", "label"]);
        assert_eq!(
            output.rows,
            vec![vec![json!(1), json!("alpha")], vec![json!(2), json!(null)]]
        );
    }
}
