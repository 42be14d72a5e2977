//! Integration tests for the federation virtual table
//!
//! Every test runs against a real on-disk store with one or more attached
//! graph databases.

use sparqlite_store::schema::ensure_resource;
use sparqlite_store::{Connection, DatabaseManager, NoopObserver, OpenOptions, StoreConfig, StoreResult};
use std::sync::Arc;
use tempfile::TempDir;

const GRAPH_A: &str = "urn:graph:a";
const GRAPH_B: &str = "urn:graph:b";

type Row = (i64, String, Option<i64>);

/// Setup helper: a store with `Items` in main and in graph A, and graph A registered
fn setup_with_test_data() -> (TempDir, DatabaseManager, i64) {
    let dir = TempDir::new().unwrap();
    let manager = DatabaseManager::open(
        StoreConfig::new(dir.path()),
        OpenOptions::read_write(),
        Arc::new(NoopObserver),
    )
    .unwrap();

    let graph_id = manager
        .with_write(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE Items (id INTEGER PRIMARY KEY, label TEXT);
                INSERT INTO Items (id, label) VALUES (1, 'alpha'), (2, 'beta'), (3, 'gamma');
                CREATE TABLE Keys (id INTEGER);
                INSERT INTO Keys (id) VALUES (1), (2), (3), (4), (5);
                "#,
            )?;

            manager.attach_database(conn, GRAPH_A, true)?;
            conn.execute_batch(
                r#"
                CREATE TABLE "urn:graph:a".Items (id INTEGER PRIMARY KEY, label TEXT);
                INSERT INTO "urn:graph:a".Items (id, label) VALUES (1, 'delta'), (4, 'epsilon');
                "#,
            )?;

            let graph_id = ensure_resource(conn, GRAPH_A)?;
            conn.create_federated_table("all_items", "Items")?;
            Ok(graph_id)
        })
        .unwrap();

    (dir, manager, graph_id)
}

fn select(conn: &mut Connection, sql: &str) -> StoreResult<Vec<Row>> {
    conn.query_map(sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
}

fn values(conn: &mut Connection, sql: &str) -> StoreResult<Vec<i64>> {
    conn.query_map(sql, [], |row| row.get(0))
}

fn labels(rows: &[Row]) -> Vec<&str> {
    rows.iter().map(|(_, label, _)| label.as_str()).collect()
}

#[test]
fn test_union_tags_rows_with_graph_id() {
    let (_dir, manager, graph) = setup_with_test_data();

    let rows = manager
        .with_write(|conn| {
            select(
                conn,
                "SELECT id, label, graph FROM temp.all_items ORDER BY graph, id",
            )
        })
        .unwrap();

    assert_eq!(
        rows,
        vec![
            (1, "alpha".to_string(), Some(0)),
            (2, "beta".to_string(), Some(0)),
            (3, "gamma".to_string(), Some(0)),
            (1, "delta".to_string(), Some(graph)),
            (4, "epsilon".to_string(), Some(graph)),
        ]
    );
}

#[test]
fn test_comparison_constraints_filter_every_database() {
    let (_dir, manager, _graph) = setup_with_test_data();

    manager
        .with_write(|conn| {
            let rows = select(
                conn,
                "SELECT id, label, graph FROM temp.all_items WHERE id > 1 AND id <= 4 ORDER BY label",
            )?;
            assert_eq!(labels(&rows), vec!["beta", "epsilon", "gamma"]);

            let rows = select(
                conn,
                "SELECT id, label, graph FROM temp.all_items WHERE id >= 3 ORDER BY label",
            )?;
            assert_eq!(labels(&rows), vec!["epsilon", "gamma"]);

            let rows = select(
                conn,
                "SELECT id, label, graph FROM temp.all_items WHERE label != 'beta' AND id = 1 ORDER BY label",
            )?;
            assert_eq!(labels(&rows), vec!["alpha", "delta"]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_graph_column_constraint() {
    let (_dir, manager, graph) = setup_with_test_data();

    manager
        .with_write(|conn| {
            let sql = format!(
                "SELECT id, label, graph FROM temp.all_items WHERE graph = {} ORDER BY id",
                graph
            );
            assert_eq!(labels(&select(conn, &sql)?), vec!["delta", "epsilon"]);

            let rows = select(
                conn,
                "SELECT id, label, graph FROM temp.all_items WHERE graph = 0 AND id > 1 ORDER BY id",
            )?;
            assert_eq!(labels(&rows), vec!["beta", "gamma"]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_unregistered_graph_has_null_id() {
    let (_dir, manager, _graph) = setup_with_test_data();

    let rows = manager
        .with_write(|conn| {
            manager.attach_database(conn, GRAPH_B, true)?;
            conn.execute_batch(
                r#"
                CREATE TABLE "urn:graph:b".Items (id INTEGER PRIMARY KEY, label TEXT);
                INSERT INTO "urn:graph:b".Items (id, label) VALUES (9, 'orphan');
                "#,
            )?;
            select(conn, "SELECT id, label, graph FROM temp.all_items WHERE id = 9")
        })
        .unwrap();

    assert_eq!(rows, vec![(9, "orphan".to_string(), None)]);
}

#[test]
fn test_repeated_filter_reuses_statements() {
    let (_dir, manager, _graph) = setup_with_test_data();
    let before = manager.federation_stats();

    // CROSS JOIN keeps Keys as the outer loop: one filter per key, same plan
    let rows = manager
        .with_write(|conn| {
            select(
                conn,
                "SELECT f.id, f.label, f.graph FROM Keys AS k CROSS JOIN temp.all_items AS f \
                 WHERE f.id = k.id ORDER BY f.label",
            )
        })
        .unwrap();
    assert_eq!(labels(&rows), vec!["alpha", "beta", "delta", "epsilon", "gamma"]);

    let after = manager.federation_stats();
    assert_eq!(after.filters - before.filters, 5);
    // main + one graph, compiled once for the whole join
    assert_eq!(after.prepares - before.prepares, 2);
}

#[test]
fn test_detached_graph_disappears_from_next_scan() {
    let (_dir, manager, _graph) = setup_with_test_data();

    manager
        .with_write(|conn| {
            let count = |conn: &mut Connection| {
                conn.query_row("SELECT COUNT(*) FROM temp.all_items", [], |row| {
                    row.get::<_, i64>(0)
                })
            };
            assert_eq!(count(conn)?, Some(5));

            manager.detach_database(conn, GRAPH_A)?;
            assert_eq!(count(conn)?, Some(3));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_missing_table_aborts_scan() {
    let (_dir, manager, _graph) = setup_with_test_data();

    manager
        .with_write(|conn| {
            manager.attach_database(conn, GRAPH_B, true)?;
            conn.execute_batch(r#"CREATE TABLE "urn:graph:b".Other (x)"#)?;

            let err = select(conn, "SELECT id, label, graph FROM temp.all_items").unwrap_err();
            assert!(err.is_query_error());

            // The connection stays usable once the offending graph is gone
            manager.detach_database(conn, GRAPH_B)?;
            assert_eq!(select(conn, "SELECT id, label, graph FROM temp.all_items")?.len(), 5);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_read_connection_federates_attached_graph() {
    let (_dir, manager, graph) = setup_with_test_data();

    let rows = manager
        .with_read(|conn| {
            manager.attach_database(conn, GRAPH_A, false)?;
            conn.create_federated_table("all_items", "Items")?;
            select(
                conn,
                "SELECT id, label, graph FROM temp.all_items WHERE graph != 0 ORDER BY id",
            )
        })
        .unwrap();

    assert_eq!(
        rows,
        vec![
            (1, "delta".to_string(), Some(graph)),
            (4, "epsilon".to_string(), Some(graph)),
        ]
    );
}

#[test]
fn test_unknown_base_table_is_rejected() {
    let (_dir, manager, _graph) = setup_with_test_data();

    let err = manager
        .with_write(|conn| conn.create_federated_table("nothing", "DoesNotExist"))
        .unwrap_err();
    assert!(err.is_query_error());
}

#[test]
fn test_text_argument_is_bound_per_database() {
    let (_dir, manager, graph) = setup_with_test_data();

    let rows = manager
        .with_write(|conn| {
            conn.query_map(
                "SELECT id, graph FROM temp.all_items WHERE label = ?1",
                ["delta"],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
        })
        .unwrap();

    assert_eq!(rows, vec![(1, Some(graph))]);
}

#[test]
fn test_scan_stopped_early_skips_unread_rows() {
    let (_dir, manager, _graph) = setup_with_test_data();

    manager
        .with_write(|conn| {
            // abs() of the smallest integer overflows when evaluated
            conn.execute_batch(
                r#"
                CREATE TABLE Raw (n INTEGER);
                INSERT INTO Raw (n) VALUES (1), (2), (-9223372036854775807 - 1);
                CREATE VIEW Magnitudes AS SELECT abs(n) AS v FROM Raw;
                CREATE TABLE "urn:graph:a".Raw (n INTEGER);
                INSERT INTO "urn:graph:a".Raw (n) VALUES (3);
                CREATE VIEW "urn:graph:a".Magnitudes AS SELECT abs(n) AS v FROM Raw;
                "#,
            )?;
            conn.create_federated_table("all_magnitudes", "Magnitudes")?;

            assert_eq!(values(conn, "SELECT v FROM temp.all_magnitudes LIMIT 1")?, vec![1]);
            assert_eq!(values(conn, "SELECT v FROM temp.all_magnitudes LIMIT 2")?, vec![1, 2]);
            assert!(values(conn, "SELECT v FROM temp.all_magnitudes")
                .unwrap_err()
                .is_query_error());
            Ok(())
        })
        .unwrap();
}
