//! Enricher: worker pool attaching LLM explanations to ENRICHING incidents.
//!
//! Enrichment never blocks notification: exhausted retries, a disabled
//! provider, or a malformed response all still advance the incident to
//! NOTIFIED, just with a null explanation and `enrichment_status = failed`.

pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::detect::incident::IncidentManager;
use crate::detect::{EnrichmentStatus, IncidentRecord, IncidentState};
use crate::storage::Pool;
use llm::{LlmBackend, LlmError};

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 2;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;

pub struct Enricher {
    incidents: IncidentManager,
    backend: LlmBackend,
    call_timeout: Duration,
    workers: usize,
}

impl Enricher {
    pub fn new(pool: Pool, backend: LlmBackend, cfg: &Config) -> Self {
        Self {
            incidents: IncidentManager::new(pool),
            backend,
            call_timeout: Duration::from_secs(cfg.llm_timeout_seconds),
            workers: cfg.enrich_workers,
        }
    }

    /// Start the worker pool over the shared queue.
    pub fn spawn(
        self,
        rx: mpsc::Receiver<Uuid>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let workers = self.workers;
        let enricher = Arc::new(self);
        let rx = Arc::new(Mutex::new(rx));

        (0..workers)
            .map(|worker_id| {
                let enricher = enricher.clone();
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(enricher, rx, shutdown, worker_id).await;
                })
            })
            .collect()
    }

    async fn process(&self, incident_id: Uuid) -> Result<()> {
        let incidents = self.incidents.clone();
        let record = tokio::task::spawn_blocking(move || incidents.get(incident_id)).await??;
        let Some(record) = record else {
            return Ok(());
        };
        // Rescued duplicates and raced recoveries show up here; skip them.
        if record.state != IncidentState::Enriching {
            debug!(%incident_id, state = record.state.as_str(), "skipping non-ENRICHING incident");
            return Ok(());
        }

        let prompt = build_prompt(&record);
        let outcome = self.call_with_retries(&prompt).await;
        // The prompt is not retained past this point.
        drop(prompt);

        let (explanation, status) = match outcome {
            Ok(text) => (Some(text), EnrichmentStatus::Succeeded),
            Err(e) => {
                warn!(%incident_id, error = %e, "enrichment failed; notifying without explanation");
                (None, EnrichmentStatus::Failed)
            }
        };

        let incidents = self.incidents.clone();
        let advanced = tokio::task::spawn_blocking(move || {
            incidents.complete_enrichment(incident_id, explanation.as_deref(), None, status)
        })
        .await??;
        if advanced {
            info!(%incident_id, status = status.as_str(), "incident notified");
        }
        Ok(())
    }

    async fn call_with_retries(&self, prompt: &str) -> Result<String, LlmError> {
        let mut backoff = BACKOFF_INITIAL;
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.call_timeout, self.backend.explain(prompt))
                .await
            {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout,
            };

            if !err.is_retriable() || attempt >= MAX_RETRIES {
                return Err(err);
            }
            attempt += 1;
            debug!(attempt, backoff_s = backoff.as_secs(), error = %err, "retrying llm call");
            tokio::time::sleep(backoff).await;
            backoff *= BACKOFF_FACTOR;
        }
    }
}

async fn worker_loop(
    enricher: Arc<Enricher>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    shutdown: CancellationToken,
    worker_id: usize,
) {
    debug!(worker_id, "enrichment worker started");
    loop {
        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                msg = guard.recv() => msg,
            }
        };
        let Some(incident_id) = next else {
            return;
        };
        if let Err(e) = enricher.process(incident_id).await {
            warn!(worker_id, %incident_id, error = %e, "enrichment processing error");
        }
    }
}

/// Prompt assembled from the incident context. Concise operator-facing
/// analysis is the whole point; the model is told exactly that.
fn build_prompt(record: &IncidentRecord) -> String {
    let provider = record.root_cause["provider"].as_str().unwrap_or("unknown");
    let country = record.root_cause["country"].as_str().unwrap_or("unknown");
    let scope = record.root_cause["scope"].as_str().unwrap_or("unknown");
    let codes = serde_json::to_string(&record.response_code_breakdown)
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        "You are a payment systems expert analyzing a real-time anomaly.\n\
         \n\
         **Incident Details:**\n\
         - Provider: {provider}\n\
         - Country: {country}\n\
         - Scope: {scope}\n\
         - Observed value: {observed:.4}\n\
         - Affected transactions: {affected}\n\
         - Revenue at risk: ${revenue:.2} USD\n\
         - Response codes: {codes}\n\
         \n\
         **Task:**\n\
         Write a concise 2-3 sentence explanation for an operations team. Include:\n\
         1. What is happening (technical root cause)\n\
         2. Why it matters (business impact)\n\
         3. Recommended immediate action\n\
         \n\
         Be specific, actionable, and avoid jargon. Focus on urgency and clarity.",
        observed = record.observed_value,
        affected = record.affected_transactions,
        revenue = record.revenue_at_risk_usd,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use chrono::Utc;

    fn sample_record() -> IncidentRecord {
        IncidentRecord {
            incident_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            dimension_key: "shopito/MX/STRIPE/_".to_string(),
            state: IncidentState::Enriching,
            severity: Severity::Warning,
            opened_at: Utc::now(),
            last_evaluated_at: Utc::now(),
            closed_at: None,
            observed_value: 0.30,
            affected_transactions: 30,
            revenue_at_risk_usd: 4321.09,
            response_code_breakdown: serde_json::json!({"504": 22, "500": 8}),
            root_cause: serde_json::json!({
                "provider": "STRIPE", "country": "MX",
                "issue": "ERROR_RATE at 30.0% with dominant response code 504",
                "scope": "All MX transactions", "response_code": "504"
            }),
            llm_explanation: None,
            suggested_action: serde_json::json!({
                "label": "Increase timeout or failover STRIPE",
                "action_type": "INCREASE_TIMEOUT"
            }),
            enrichment_status: EnrichmentStatus::Pending,
            confidence_score: 0.85,
            sla_breach_countdown_seconds: None,
        }
    }

    #[test]
    fn test_prompt_carries_incident_context() {
        let prompt = build_prompt(&sample_record());
        assert!(prompt.contains("STRIPE"));
        assert!(prompt.contains("MX"));
        assert!(prompt.contains("30"));
        assert!(prompt.contains("$4321.09"));
        assert!(prompt.contains("504"));
    }

    #[tokio::test]
    async fn test_disabled_backend_is_not_retried() {
        let enricher = Enricher {
            incidents: IncidentManager::new({
                let manager = r2d2_sqlite::SqliteConnectionManager::memory();
                r2d2::Pool::builder().max_size(1).build(manager).unwrap()
            }),
            backend: LlmBackend::Disabled,
            call_timeout: Duration::from_secs(1),
            workers: 1,
        };

        let started = std::time::Instant::now();
        let err = enricher.call_with_retries("prompt").await.unwrap_err();
        assert!(matches!(err, LlmError::Disabled));
        // No backoff sleeps happened.
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
