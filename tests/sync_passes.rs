//! Upload and download pass properties: idempotence, failure isolation,
//! single flight, type conversion on the way to the primary.
//!
//! Run with: `cargo test --test sync_passes`

mod common;

use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;

use common::{offline_db_with, FlakyPrimary};
use offline_db::{params, OfflineDb, SyncOutcome};

/// Coordinator that started online and then lost the primary. Reconnect
/// uploads are off so each test drives the passes itself.
async fn offline_after_start(dir: &tempfile::TempDir) -> (std::sync::Arc<FlakyPrimary>, OfflineDb) {
    let primary = FlakyPrimary::new().await;
    let db = offline_db_with(dir, primary.clone(), |c| c.upload_on_reconnect = false).await;
    db.start().await.unwrap();
    primary.set_reachable(false);
    db.monitor().probe().await;
    (primary, db)
}

fn go_online(primary: &FlakyPrimary, db: &OfflineDb) {
    primary.set_reachable(true);
    db.manager().state().record_probe(true);
}

#[tokio::test]
async fn second_upload_performs_no_writes() {
    let dir = tempdir().unwrap();
    let (primary, db) = offline_after_start(&dir).await;
    db.query(
        "INSERT INTO users (first_name, username, password_hash) VALUES ($1, $2, $3)",
        &params!["Lee", "lee", "pw"],
    )
    .await
    .unwrap();
    go_online(&primary, &db);

    let first = db.sync_engine().sync_to_primary().await;
    assert_eq!(first.record().expect("upload ran").synced_total(), 1);
    let writes = primary.writes();
    assert_eq!(writes, 1);

    let again = db.sync_engine().sync_to_primary().await;
    let run = again.record().expect("upload ran");
    assert_eq!(run.synced_total(), 0);
    assert_eq!(primary.writes(), writes);
    db.shutdown().await;
}

#[tokio::test]
async fn failing_row_does_not_block_later_rows_or_tables() {
    let dir = tempdir().unwrap();
    let (primary, db) = offline_after_start(&dir).await;

    db.query(
        "INSERT INTO users (first_name, username, password_hash) VALUES ($1, $2, $3)",
        &params!["Ok", "ok", "pw"],
    )
    .await
    .unwrap();
    // Collides with the UNIQUE username of the row above once both reach the primary
    primary
        .rows(
            "INSERT INTO users (id, first_name, username, password_hash) VALUES ($1, $2, $3, $4)",
            &params![50_i64, "Taken", "dup", "pw"],
        )
        .await;
    db.query(
        "INSERT INTO users (first_name, username, password_hash) VALUES ($1, $2, $3)",
        &params!["Dup", "dup", "pw"],
    )
    .await
    .unwrap();
    db.query(
        "INSERT INTO inventory (product_name, quantity) VALUES ($1, $2)",
        &params!["Pipettes", 5_i64],
    )
    .await
    .unwrap();

    go_online(&primary, &db);
    let outcome = db.sync_engine().sync_to_primary().await;
    let run = outcome.record().expect("upload ran");

    assert!(run.success);
    let users = run.table("users").unwrap();
    assert_eq!(users.synced, 1);
    assert_eq!(users.failed, 1);
    assert_eq!(run.table("inventory").unwrap().synced, 1);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].table, "users");
    assert_eq!(run.failures[0].id, json!(2));

    let on_primary = primary.rows("SELECT product_name FROM inventory", &[]).await;
    assert_eq!(on_primary[0]["product_name"], json!("Pipettes"));
    db.shutdown().await;
}

#[tokio::test]
async fn concurrent_uploads_run_once() {
    let dir = tempdir().unwrap();
    let (primary, db) = offline_after_start(&dir).await;
    for i in 0..3_i64 {
        db.query(
            "INSERT INTO reports (kind, user_id) VALUES ($1, $2)",
            &params![format!("batch-{i}"), None::<i64>],
        )
        .await
        .unwrap();
    }
    go_online(&primary, &db);
    primary.set_delay(Duration::from_millis(30));

    let engine = db.sync_engine().clone();
    let (a, b) = tokio::join!(engine.sync_to_primary(), engine.sync_to_primary());
    let outcomes = [a, b];

    let ran = outcomes.iter().filter(|o| o.is_completed()).count();
    let rejected = outcomes.iter().filter(|o| **o == SyncOutcome::AlreadyRunning).count();
    assert_eq!(ran, 1);
    assert_eq!(rejected, 1);

    let reports = primary.rows("SELECT COUNT(*) AS n FROM reports", &[]).await;
    assert_eq!(reports[0]["n"], json!(3));
    assert_eq!(primary.writes(), 3);
    db.shutdown().await;
}

#[tokio::test]
async fn upload_converts_local_types_for_the_primary() {
    let dir = tempdir().unwrap();
    let (primary, db) = offline_after_start(&dir).await;

    db.query(
        "INSERT INTO users (first_name, username, password_hash) VALUES ($1, $2, $3)",
        &params!["Ana", "ana", "pw"],
    )
    .await
    .unwrap();
    db.query(
        "INSERT INTO patients (first_name, birth_date, user_id) VALUES ($1, $2, $3)",
        &params!["Ivo", chrono::NaiveDate::from_ymd_opt(1990, 2, 3).unwrap(), 1_i64],
    )
    .await
    .unwrap();
    db.query("INSERT INTO samples (patient_id, paid) VALUES ($1, $2)", &params![1_i64, true])
        .await
        .unwrap();
    db.query(
        "INSERT INTO sample_details (sample_id, sample_type, results) VALUES ($1, $2, $3)",
        &params![1_i64, "blood", json!({"hb": 13.5, "flags": ["ok"]})],
    )
    .await
    .unwrap();

    go_online(&primary, &db);
    let run = db.sync_engine().sync_to_primary().await;
    assert_eq!(run.record().unwrap().synced_total(), 4);
    assert!(run.record().unwrap().failures.is_empty());

    let patient = primary.rows("SELECT birth_date FROM patients", &[]).await;
    assert_eq!(patient[0]["birth_date"], json!("1990-02-03"));
    let sample = primary.rows("SELECT paid FROM samples", &[]).await;
    assert_eq!(sample[0]["paid"], json!(1));
    let detail = primary.rows("SELECT results FROM sample_details", &[]).await;
    let results: serde_json::Value = serde_json::from_str(detail[0]["results"].as_str().unwrap()).unwrap();
    assert_eq!(results, json!({"hb": 13.5, "flags": ["ok"]}));
    db.shutdown().await;
}

#[tokio::test]
async fn download_while_offline_is_refused() {
    let dir = tempdir().unwrap();
    let (_primary, db) = offline_after_start(&dir).await;
    let runs_before = db.sync_engine().status().total_runs;
    assert_eq!(db.download_from_primary().await, SyncOutcome::Offline);
    assert_eq!(db.sync_to_primary().await, SyncOutcome::Offline);
    assert_eq!(db.sync_engine().status().total_runs, runs_before);
    db.shutdown().await;
}

#[tokio::test]
async fn download_leaves_local_edits_for_upload() {
    let dir = tempdir().unwrap();
    let primary = FlakyPrimary::new().await;
    primary
        .rows(
            "INSERT INTO users (first_name, username, email, password_hash) VALUES ($1, $2, $3, $4)",
            &params!["Mia", "mia", "mia@lab.test", "pw"],
        )
        .await;
    let db = offline_db_with(&dir, primary.clone(), |c| c.upload_on_reconnect = false).await;
    db.start().await.unwrap();

    primary.set_reachable(false);
    db.monitor().probe().await;
    db.query("UPDATE users SET email = $1 WHERE id = $2", &params!["local@lab.test", 1_i64])
        .await
        .unwrap();
    primary
        .rows("UPDATE users SET email = $1 WHERE id = $2", &params!["remote@lab.test", 1_i64])
        .await;

    go_online(&primary, &db);
    let download = db.download_from_primary().await;
    let users = download.record().unwrap().table("users").unwrap().clone();
    assert_eq!(users.synced, 0);
    assert_eq!(users.skipped, 1);

    let local = db.manager().fallback().unwrap().pool().clone();
    let email: String = sqlx::query_scalar("SELECT email FROM users WHERE id = 1")
        .fetch_one(&local)
        .await
        .unwrap();
    assert_eq!(email, "local@lab.test");

    db.sync_to_primary().await;
    let remote = primary.rows("SELECT email FROM users WHERE id = 1", &[]).await;
    assert_eq!(remote[0]["email"], json!("local@lab.test"));
    db.shutdown().await;
}
