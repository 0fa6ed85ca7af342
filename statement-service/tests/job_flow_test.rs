//! Integration tests for batch jobs: progress, partial failure, and SSE.

mod common;

use common::{spawn_app, wait_for_job};
use reqwest::multipart;

fn statement_content(day: u32) -> String {
    format!(
        "opening=100.00,closing=90.00,start=2026-03-01,end=2026-03-31\n2026-03-{:02},Coffee,debit,10.00\n",
        day
    )
}

async fn upload(app: &common::TestApp, files: Vec<(String, String)>) -> serde_json::Value {
    let mut form = multipart::Form::new();
    for (name, content) in files {
        form = form.part(
            "file",
            multipart::Part::bytes(content.into_bytes()).file_name(name),
        );
    }

    app.client
        .post(app.url("/statements"))
        .header("X-User-ID", &app.owner_id)
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn partial_failure_completes_with_failure_count() {
    let Some(app) = spawn_app().await else { return };

    // Items 2 and 4 fail extraction.
    let files = (1..=5)
        .map(|i| {
            let content = if i == 2 || i == 4 {
                "ERROR".to_string()
            } else {
                statement_content(i)
            };
            (format!("file-{}.txt", i), content)
        })
        .collect();

    let body = upload(&app, files).await;
    let job_id = body["job"]["job_id"].as_str().unwrap().to_string();

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["error_message"], "2 of 5 files failed");
    assert_eq!(job["completed_items"], 5);
    assert_eq!(job["progress"], 100);

    let items = job["items"].as_array().unwrap();
    assert_eq!(items.len(), 5);
    let failed: Vec<&str> = items
        .iter()
        .filter(|i| i["status"] == "failed")
        .map(|i| i["file_name"].as_str().unwrap())
        .collect();
    assert_eq!(failed, vec!["file-2.txt", "file-4.txt"]);
    for item in items.iter().filter(|i| i["status"] == "failed") {
        assert!(item["error_message"].is_string());
    }
}

#[tokio::test]
async fn all_items_failing_fails_the_job() {
    let Some(app) = spawn_app().await else { return };

    let files = (1..=3)
        .map(|i| (format!("bad-{}.txt", i), "ERROR".to_string()))
        .collect();

    let body = upload(&app, files).await;
    let job_id = body["job"]["job_id"].as_str().unwrap().to_string();

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error_message"], "All files failed");
}

#[tokio::test]
async fn progress_stream_emits_snapshots() {
    let Some(app) = spawn_app().await else { return };

    let body = upload(
        &app,
        vec![("jan.txt".to_string(), statement_content(1))],
    )
    .await;
    let job_id = body["job"]["job_id"].as_str().unwrap().to_string();

    let mut response = app
        .client
        .get(app.url(&format!("/jobs/{}/progress", job_id)))
        .header("X-User-ID", &app.owner_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // The stream closes after the terminal snapshot; collect it all.
    let mut raw = Vec::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        raw.extend_from_slice(&chunk);
    }
    let raw = String::from_utf8_lossy(&raw);

    // A fast job may reach its terminal state before the first poll, so
    // only the closing `done` event is guaranteed.
    assert!(raw.contains("event: done"), "no done event in: {raw}");
    assert!(
        raw.contains("\"progress\":100") || raw.contains("\"status\":\"failed\""),
        "stream ended before a terminal snapshot: {raw}"
    );
}

#[tokio::test]
async fn progress_stream_for_unknown_job_is_404() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .client
        .get(app.url(&format!("/jobs/{}/progress", uuid::Uuid::new_v4())))
        .header("X-User-ID", &app.owner_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn jobs_are_owner_scoped() {
    let Some(app) = spawn_app().await else { return };

    let body = upload(
        &app,
        vec![("jan.txt".to_string(), statement_content(1))],
    )
    .await;
    let job_id = body["job"]["job_id"].as_str().unwrap().to_string();
    wait_for_job(&app, &job_id).await;

    let response = app
        .client
        .get(app.url(&format!("/jobs/{}", job_id)))
        .header("X-User-ID", "someone-else")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
