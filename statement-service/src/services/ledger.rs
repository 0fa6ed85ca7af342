//! Fire-and-forget notification to the downstream ledger recalculation hook.

use std::time::Duration;

/// Notifies the ledger service that an owner's transaction set changed and
/// net-worth figures should be recomputed. Best-effort: failures are logged
/// and never propagate to statement processing.
pub struct LedgerHook {
    client: reqwest::Client,
    url: Option<String>,
}

impl LedgerHook {
    pub fn new(recalc_url: &str) -> Self {
        let url = if recalc_url.is_empty() {
            tracing::info!("Ledger recalc URL not configured - notifications disabled");
            None
        } else {
            Some(recalc_url.to_string())
        };

        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url,
        }
    }

    /// Spawn the notification and return immediately.
    pub fn notify_recalculation(&self, owner_id: &str) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        let owner_id = owner_id.to_string();

        tokio::spawn(async move {
            let endpoint = format!("{}/recalculate", url.trim_end_matches('/'));
            let result = client
                .post(&endpoint)
                .json(&serde_json::json!({ "owner_id": owner_id }))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(owner_id = %owner_id, "Ledger recalculation requested");
                }
                Ok(resp) => {
                    tracing::warn!(
                        owner_id = %owner_id,
                        status = %resp.status(),
                        "Ledger recalculation hook rejected the request"
                    );
                }
                Err(e) => {
                    tracing::warn!(owner_id = %owner_id, error = %e, "Ledger recalculation hook unreachable");
                }
            }
        });
    }
}
