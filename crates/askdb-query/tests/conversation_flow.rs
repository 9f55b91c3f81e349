//! End-to-end conversations against a real SQLite database.
//!
//! Each test builds its own database file and session store in a temporary
//! directory, so tests are independent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;

use askdb_core::config::AskConfig;
use askdb_core::safety::MUTATING_KEYWORDS;
use askdb_core::types::{CellValue, ChartHint, QueryClass};
use askdb_query::{ContextAwareQueryProcessor, QueryError, SqliteConnector};
use askdb_storage::SqliteSessionStore;

// =============================================================================
// Helpers
// =============================================================================

fn seed_database(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             city TEXT
         );
         CREATE TABLE sales (
             id INTEGER PRIMARY KEY,
             customer_id INTEGER REFERENCES customers(id),
             region TEXT,
             year INTEGER,
             amount REAL
         );
         INSERT INTO customers VALUES
             (1, 'Ada', 'London'), (2, 'Grace', 'New York'), (3, 'Linus', 'Helsinki');
         INSERT INTO sales VALUES
             (1, 1, 'West', 2019, 100.0),
             (2, 2, 'East', 2019, 50.0),
             (3, 1, 'West', 2020, 75.0),
             (4, 3, 'North', 2020, 20.0),
             (5, 2, 'East', 2020, 30.0);",
    )
    .unwrap();
}

struct Fixture {
    _dir: TempDir,
    db_path: PathBuf,
    processor: ContextAwareQueryProcessor,
}

fn make_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("shop.db");
    seed_database(&db_path);

    let connector = SqliteConnector::open(&db_path).unwrap();
    let store = SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap();
    let processor =
        ContextAwareQueryProcessor::new(Arc::new(store), Arc::new(connector), &AskConfig::default());
    Fixture {
        _dir: dir,
        db_path,
        processor,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_year_followup_keeps_entity() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let first = fx.processor.process(sid, "show sales for 2019").await.unwrap();
    assert_eq!(
        first.turn.generated_sql.as_deref(),
        Some("SELECT * FROM sales WHERE year = 2019")
    );
    assert_eq!(first.result.unwrap().row_count(), 2);

    let second = fx.processor.process(sid, "What about 2020?").await.unwrap();
    assert_eq!(second.turn.classification, QueryClass::FollowUp);
    assert_eq!(
        second.turn.generated_sql.as_deref(),
        Some("SELECT * FROM sales WHERE year = 2020")
    );
    assert_eq!(second.result.unwrap().row_count(), 3);
}

#[tokio::test]
async fn test_all_customers_is_a_table() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let outcome = fx.processor.process(sid, "show me all customers").await.unwrap();
    assert_eq!(
        outcome.turn.generated_sql.as_deref(),
        Some("SELECT * FROM customers")
    );
    assert_eq!(outcome.turn.chart_hint, Some(ChartHint::Table));
    assert_eq!(outcome.result.unwrap().row_count(), 3);
}

#[tokio::test]
async fn test_grouped_totals_suggest_bar_chart() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let outcome = fx.processor.process(sid, "total sales by region").await.unwrap();
    let chart = outcome.chart.unwrap();
    assert_eq!(chart.hint, ChartHint::Bar);
    assert_eq!(chart.x.as_deref(), Some("region"));
    assert_eq!(chart.y.as_deref(), Some("sum_amount"));

    let result = outcome.result.unwrap();
    let west = result
        .rows
        .iter()
        .find(|r| r[0] == CellValue::Text("West".into()))
        .unwrap();
    assert_eq!(west[1], CellValue::Float(175.0));
}

#[tokio::test]
async fn test_unknown_table_is_schema_mismatch() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let err = fx.processor.process(sid, "show me foobar").await.unwrap_err();
    assert!(matches!(err, QueryError::SchemaMismatch { ref term } if term == "foobar"));

    let history = fx.processor.history(sid).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_failed());
    assert!(history[0].generated_sql.is_none());
    assert!(history[0].result_summary.is_none());
}

#[tokio::test]
async fn test_delete_request_is_refused() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let err = fx.processor.process(sid, "delete all customers").await.unwrap_err();
    assert!(matches!(err, QueryError::SecurityViolation { .. }));

    // Nothing was deleted.
    let outcome = fx.processor.process(sid, "show me all customers").await.unwrap();
    assert_eq!(outcome.result.unwrap().row_count(), 3);
}

#[tokio::test]
async fn test_failed_turn_is_skipped_as_antecedent() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    fx.processor.process(sid, "show sales for 2019").await.unwrap();
    assert!(fx.processor.process(sid, "show me foobar").await.is_err());
    let outcome = fx.processor.process(sid, "What about 2020?").await.unwrap();
    assert_eq!(
        outcome.turn.generated_sql.as_deref(),
        Some("SELECT * FROM sales WHERE year = 2020")
    );
}

#[tokio::test]
async fn test_schema_questions_run_metadata_queries() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    let outcome = fx.processor.process(sid, "what tables are there?").await.unwrap();
    assert_eq!(outcome.turn.classification, QueryClass::Schema);
    let names: Vec<String> = outcome
        .result
        .unwrap()
        .rows
        .iter()
        .map(|r| r[0].to_string())
        .collect();
    assert_eq!(names, vec!["customers", "sales"]);

    let outcome = fx.processor.process(sid, "describe customers").await.unwrap();
    assert_eq!(outcome.result.unwrap().row_count(), 3);
}

#[tokio::test]
async fn test_no_generated_sql_contains_mutating_keywords() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();

    for question in [
        "show sales for 2019",
        "What about 2020?",
        "total sales by region",
        "top 2 sales",
        "show me all customers",
        "customers whose city is London",
    ] {
        let _ = fx.processor.process(sid, question).await;
    }

    for turn in fx.processor.history(sid).unwrap() {
        let Some(sql) = turn.generated_sql else {
            continue;
        };
        let lower = sql.to_lowercase();
        for keyword in MUTATING_KEYWORDS {
            assert!(
                !lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == *keyword),
                "{sql} contains {keyword}"
            );
        }
    }
}

fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_mutating_requests_are_refused_in_every_class() {
    let fx = make_fixture();
    let sid = fx.processor.new_session().unwrap();
    fx.processor.process(sid, "show sales for 2019").await.unwrap();

    // A follow-up on the rows just shown, then a schema-flavoured request.
    for question in ["delete those", "drop the customers columns"] {
        let err = fx.processor.process(sid, question).await.unwrap_err();
        assert!(
            matches!(err, QueryError::SecurityViolation { .. }),
            "{question}: {err:?}"
        );
    }

    let history = fx.processor.history(sid).unwrap();
    assert_eq!(history.len(), 3);
    for turn in &history[1..] {
        assert!(turn.is_failed());
        let sql = turn.generated_sql.as_deref().unwrap_or_default().to_lowercase();
        assert!(!sql.contains("delete") && !sql.contains("drop"), "{sql}");
    }

    let conn = Connection::open(&fx.db_path).unwrap();
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(tables, 2);
    assert_eq!(count_rows(&fx.db_path, "sales"), 5);
    assert_eq!(count_rows(&fx.db_path, "customers"), 3);
}

#[tokio::test]
async fn test_history_survives_reopening_store() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("shop.db");
    seed_database(&db_path);
    let sessions = dir.path().join("sessions.db");

    let sid = {
        let processor = ContextAwareQueryProcessor::new(
            Arc::new(SqliteSessionStore::open(&sessions).unwrap()),
            Arc::new(SqliteConnector::open(&db_path).unwrap()),
            &AskConfig::default(),
        );
        let sid = processor.new_session().unwrap();
        processor.process(sid, "show sales for 2019").await.unwrap();
        sid
    };

    let processor = ContextAwareQueryProcessor::new(
        Arc::new(SqliteSessionStore::open(&sessions).unwrap()),
        Arc::new(SqliteConnector::open(&db_path).unwrap()),
        &AskConfig::default(),
    );
    let outcome = processor.process(sid, "What about 2020?").await.unwrap();
    assert_eq!(
        outcome.turn.generated_sql.as_deref(),
        Some("SELECT * FROM sales WHERE year = 2020")
    );
}
