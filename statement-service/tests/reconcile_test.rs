//! Integration tests for sync pulls and statement reconciliation.

mod common;

use common::{spawn_app_with, wait_for_job, FixtureExtractor, ScriptedProvider, TestApp};
use reqwest::multipart;
use rust_decimal::Decimal;
use statement_service::services::sync_provider::{ProviderTransaction, SyncPage};
use std::sync::Arc;

fn provider_txn(
    external_id: &str,
    date: &str,
    description: &str,
    amount: &str,
    pending: bool,
) -> ProviderTransaction {
    ProviderTransaction {
        external_id: external_id.to_string(),
        date: date.parse().unwrap(),
        description: description.to_string(),
        amount: amount.parse().unwrap(),
        pending,
        category: None,
    }
}

async fn spawn_with_pages(pages: Vec<SyncPage>) -> Option<(TestApp, Arc<ScriptedProvider>)> {
    let provider = Arc::new(ScriptedProvider::new(pages));
    let app = spawn_app_with(Arc::new(FixtureExtractor), provider.clone()).await?;
    Some((app, provider))
}

async fn create_connection(app: &TestApp) -> String {
    let body: serde_json::Value = app
        .client
        .post(app.url("/sync/connections"))
        .header("X-User-ID", &app.owner_id)
        .json(&serde_json::json!({ "provider_item_id": format!("item-{}", app.owner_id) }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["connection_id"].as_str().unwrap().to_string()
}

/// Trigger a detached sync and wait for the cursor the provider's last
/// page carries to be persisted.
async fn sync_and_wait(app: &TestApp, connection_id: &str, expected_cursor: &str) {
    let response = app
        .client
        .post(app.url(&format!("/sync/connections/{}/sync", connection_id)))
        .header("X-User-ID", &app.owner_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    for _ in 0..100 {
        let (cursor,): (Option<String>,) =
            sqlx::query_as("SELECT cursor FROM sync_connections WHERE connection_id = $1")
                .bind(connection_id.parse::<uuid::Uuid>().unwrap())
                .fetch_one(app.db.pool())
                .await
                .unwrap();
        if cursor.as_deref() == Some(expected_cursor) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("sync did not reach cursor {expected_cursor}");
}

#[tokio::test]
async fn sync_accumulates_pages_and_persists_final_cursor() {
    let pages = vec![
        SyncPage {
            added: vec![provider_txn("ext-1", "2026-02-03", "Coffee Shop", "4.50", false)],
            modified: vec![],
            removed: vec![],
            next_cursor: "cursor-1".to_string(),
            has_more: true,
        },
        SyncPage {
            added: vec![provider_txn("ext-2", "2026-02-04", "Payroll", "-1200.00", false)],
            modified: vec![],
            removed: vec![],
            next_cursor: "cursor-2".to_string(),
            has_more: false,
        },
    ];
    let Some((app, provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;
    sync_and_wait(&app, &connection_id, "cursor-2").await;

    // The provider saw no cursor first, then the one it handed back.
    let cursors = provider.cursors_seen.lock().unwrap().clone();
    assert_eq!(cursors, vec![None, Some("cursor-1".to_string())]);

    // Provider signs are inverted at ingress: positive becomes an outflow.
    let amounts: Vec<(String, Decimal)> = sqlx::query_as(
        "SELECT external_id, amount FROM transactions WHERE owner_id = $1 ORDER BY external_id",
    )
    .bind(&app.owner_id)
    .fetch_all(app.db.pool())
    .await
    .unwrap();
    assert_eq!(amounts.len(), 2);
    assert_eq!(amounts[0], ("ext-1".to_string(), "-4.50".parse().unwrap()));
    assert_eq!(amounts[1], ("ext-2".to_string(), "1200.00".parse().unwrap()));
}

#[tokio::test]
async fn next_sync_resumes_from_persisted_cursor() {
    let pages = vec![
        SyncPage {
            added: vec![provider_txn("ext-1", "2026-02-03", "Coffee Shop", "4.50", false)],
            modified: vec![],
            removed: vec![],
            next_cursor: "cursor-1".to_string(),
            has_more: false,
        },
        SyncPage {
            added: vec![],
            modified: vec![],
            removed: vec![],
            next_cursor: "cursor-2".to_string(),
            has_more: false,
        },
    ];
    let Some((app, provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;
    sync_and_wait(&app, &connection_id, "cursor-1").await;
    sync_and_wait(&app, &connection_id, "cursor-2").await;

    let cursors = provider.cursors_seen.lock().unwrap().clone();
    assert_eq!(cursors, vec![None, Some("cursor-1".to_string())]);
}

#[tokio::test]
async fn modified_and_removed_deltas_are_applied() {
    let pages = vec![
        SyncPage {
            added: vec![
                provider_txn("ext-1", "2026-02-03", "Coffee Shop", "4.50", true),
                provider_txn("ext-2", "2026-02-04", "Grocer", "20.00", false),
            ],
            modified: vec![],
            removed: vec![],
            next_cursor: "cursor-1".to_string(),
            has_more: false,
        },
        SyncPage {
            added: vec![],
            // Settled: no longer pending, final amount differs.
            modified: vec![provider_txn("ext-1", "2026-02-03", "Coffee Shop", "4.75", false)],
            removed: vec!["ext-2".to_string()],
            next_cursor: "cursor-2".to_string(),
            has_more: false,
        },
    ];
    let Some((app, _provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;
    sync_and_wait(&app, &connection_id, "cursor-1").await;
    sync_and_wait(&app, &connection_id, "cursor-2").await;

    let rows: Vec<(String, Decimal, bool)> = sqlx::query_as(
        "SELECT external_id, amount, is_provisional FROM transactions WHERE owner_id = $1",
    )
    .bind(&app.owner_id)
    .fetch_all(app.db.pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "ext-1");
    assert_eq!(rows[0].1, "-4.75".parse::<Decimal>().unwrap());
    assert!(!rows[0].2);
}

#[tokio::test]
async fn statement_processing_reconciles_provisional_rows() {
    let pages = vec![SyncPage {
        added: vec![
            // Matches a statement line fuzzily (containment, same date/amount).
            provider_txn("ext-1", "2026-01-15", "Starbucks", "4.50", true),
            // In the period, but nothing in the statement corresponds.
            provider_txn("ext-2", "2026-01-20", "Vending Machine", "2.00", true),
            // Outside the statement period: untouched.
            provider_txn("ext-3", "2026-03-01", "Starbucks", "4.50", true),
        ],
        modified: vec![],
        removed: vec![],
        next_cursor: "cursor-1".to_string(),
        has_more: false,
    }];
    let Some((app, _provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;
    sync_and_wait(&app, &connection_id, "cursor-1").await;

    let content = "\
opening=100.00,closing=95.50,start=2026-01-01,end=2026-01-31
2026-01-15,STARBUCKS #1234,debit,4.50
";
    let form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(content.as_bytes().to_vec()).file_name("jan.txt".to_string()),
    );
    let body: serde_json::Value = app
        .client
        .post(app.url("/statements"))
        .header("X-User-ID", &app.owner_id)
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    wait_for_job(&app, body["job"]["job_id"].as_str().unwrap()).await;

    let rows: Vec<(Option<String>, bool)> = sqlx::query_as(
        "SELECT external_id, is_provisional FROM transactions
         WHERE owner_id = $1 AND source = 'sync' ORDER BY external_id",
    )
    .bind(&app.owner_id)
    .fetch_all(app.db.pool())
    .await
    .unwrap();

    // ext-1 was superseded by the statement row; ext-2 was corroborated;
    // ext-3 is outside the period and stays provisional.
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], (Some("ext-2".to_string()), false));
    assert_eq!(rows[1], (Some("ext-3".to_string()), true));
}

#[tokio::test]
async fn webhook_resolves_owner_and_syncs() {
    let pages = vec![SyncPage {
        added: vec![provider_txn("ext-1", "2026-02-03", "Coffee Shop", "4.50", false)],
        modified: vec![],
        removed: vec![],
        next_cursor: "cursor-1".to_string(),
        has_more: false,
    }];
    let Some((app, _provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;

    let response = app
        .client
        .post(app.url("/sync/webhook"))
        .json(&serde_json::json!({ "provider_item_id": format!("item-{}", app.owner_id) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["connection_id"].as_str().unwrap(), connection_id);

    // The pull itself is detached; wait for its effect.
    for _ in 0..100 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE owner_id = $1")
                .bind(&app.owner_id)
                .fetch_one(app.db.pool())
                .await
                .unwrap();
        if count == 1 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("webhook sync never applied the delta");
}

#[tokio::test]
async fn webhook_for_unknown_item_is_404() {
    let Some((app, _provider)) = spawn_with_pages(vec![]).await else { return };

    let response = app
        .client
        .post(app.url("/sync/webhook"))
        .json(&serde_json::json!({ "provider_item_id": "nobody-registered-this" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn provider_failure_marks_the_connection() {
    // No scripted pages: the first pull fails.
    let Some((app, _provider)) = spawn_with_pages(vec![]).await else { return };

    let connection_id = create_connection(&app).await;
    let response = app
        .client
        .post(app.url(&format!("/sync/connections/{}/sync", connection_id)))
        .header("X-User-ID", &app.owner_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    for _ in 0..100 {
        let (status, error): (String, Option<String>) = sqlx::query_as(
            "SELECT status, error_message FROM sync_connections WHERE connection_id = $1",
        )
        .bind(connection_id.parse::<uuid::Uuid>().unwrap())
        .fetch_one(app.db.pool())
        .await
        .unwrap();
        if status == "error" {
            assert!(error.is_some());
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("connection was never marked errored");
}

#[tokio::test]
async fn apply_failure_marks_the_connection_and_keeps_cursor() {
    // Postgres rejects NUL bytes in TEXT, so this delta fails when applied
    // rather than when pulled.
    let pages = vec![SyncPage {
        added: vec![provider_txn("bad\u{0}id", "2026-02-03", "Coffee Shop", "4.50", false)],
        modified: vec![],
        removed: vec![],
        next_cursor: "cursor-1".to_string(),
        has_more: false,
    }];
    let Some((app, _provider)) = spawn_with_pages(pages).await else { return };

    let connection_id = create_connection(&app).await;
    let response = app
        .client
        .post(app.url(&format!("/sync/connections/{}/sync", connection_id)))
        .header("X-User-ID", &app.owner_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    for _ in 0..100 {
        let (status, error, cursor): (String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT status, error_message, cursor FROM sync_connections WHERE connection_id = $1",
        )
        .bind(connection_id.parse::<uuid::Uuid>().unwrap())
        .fetch_one(app.db.pool())
        .await
        .unwrap();
        if status == "error" {
            assert!(error.is_some());
            // The run never completed, so the cursor must not advance.
            assert_eq!(cursor, None);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("connection was never marked errored");
}

#[tokio::test]
async fn duplicate_connection_for_same_item_conflicts() {
    let Some((app, _provider)) = spawn_with_pages(vec![]).await else { return };

    create_connection(&app).await;
    let response = app
        .client
        .post(app.url("/sync/connections"))
        .header("X-User-ID", &app.owner_id)
        .json(&serde_json::json!({ "provider_item_id": format!("item-{}", app.owner_id) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}
