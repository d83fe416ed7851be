//! # Replay
//!
//! Operator tooling over the local submission cache.
//!
//! ## Resubmission
//! - A failed record is pending until some later record names it in `replay_of`
//! - Pending records go through the same retry loop as live traffic, with their
//!   original `client_id`, so an insert that secretly landed comes back as success
//! - Success appends a fresh persisted record; nothing already cached is rewritten
//! - Duplicates are reported and left pending, the email is already registered
use std::collections::HashSet;

use indicatif::ProgressBar;
use records::{FormKind, StorageError, SubmissionRecord, SubmissionStatus};
use server::{
    cache::SubmissionCache,
    client::{SubmissionContext, SubmissionOutcome},
    retry::Retrier,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub fn describe(record: &SubmissionRecord) -> String {
    let replay = record
        .replay_of
        .map(|id| format!(" (replay of {id})"))
        .unwrap_or_default();

    format!(
        "{} {:?} {} <{}> {}{replay}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.status,
        record.name,
        record.email,
        record.client_id,
    )
}

pub fn pending_replays(records: &[SubmissionRecord]) -> Vec<SubmissionRecord> {
    let replayed: HashSet<_> = records.iter().filter_map(|r| r.replay_of).collect();

    records
        .iter()
        .filter(|r| r.status == SubmissionStatus::Failed && !replayed.contains(&r.client_id))
        .cloned()
        .collect()
}

fn replay_context() -> SubmissionContext {
    SubmissionContext {
        session_id: "replay".to_string(),
        fingerprint: "replay".to_string(),
        user_agent: concat!("replay/", env!("CARGO_PKG_VERSION")).to_string(),
    }
}

pub async fn resubmit(
    cache: &SubmissionCache,
    retrier: &Retrier,
    kind: FormKind,
    cancel: &CancellationToken,
    pb: &ProgressBar,
) -> Result<ReplaySummary, StorageError> {
    let pending = pending_replays(&cache.list(kind).await);
    let ctx = replay_context();
    let mut summary = ReplaySummary::default();

    info!("{} failed {kind} submissions to replay", pending.len());

    for record in &pending {
        pb.set_message(record.email.clone());

        let Ok(outcome) = retrier.submit_with_retry(record, &ctx, cancel).await else {
            summary.cancelled = true;
            break;
        };

        match outcome {
            SubmissionOutcome::Success { server_id, .. } => {
                cache.append(record.replayed()).await?;
                info!(client_id = %record.client_id, server_id = %server_id, "Replayed");
                summary.replayed += 1;
            }
            SubmissionOutcome::DuplicateRejected { .. } => {
                warn!(client_id = %record.client_id, "Already registered, skipped");
                summary.duplicates += 1;
            }
            SubmissionOutcome::TransientFailure { cause }
            | SubmissionOutcome::TerminalFailure { cause } => {
                warn!(client_id = %record.client_id, "Still failing: {cause}");
                summary.failed += 1;
            }
        }

        pb.inc(1);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use records::{FormDetails, MemoryStorage, Profile};
    use server::{
        client::{RemoteClient, TableAnalytics},
        persistence::{Persistence, SimulatedBackend},
        retry::RetryPolicy,
    };

    use super::*;

    fn failed_beta(email: &str) -> SubmissionRecord {
        SubmissionRecord::new(
            "Jane Doe",
            email,
            "landing_page",
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: None,
            },
        )
        .with_status(SubmissionStatus::Failed)
    }

    fn setup() -> (Arc<SimulatedBackend>, SubmissionCache, Retrier) {
        let backend = Arc::new(SimulatedBackend::default());
        let persistence: Arc<dyn Persistence> = backend.clone();
        let client = RemoteClient::new(
            persistence.clone(),
            Arc::new(TableAnalytics::new(persistence)),
        );
        let retrier = Retrier::new(Arc::new(client), RetryPolicy::default());
        let cache = SubmissionCache::new(Arc::new(MemoryStorage::new()), "opentalent");

        (backend, cache, retrier)
    }

    #[test]
    fn test_pending_skips_replayed_and_persisted() {
        let first = failed_beta("a@example.com");
        let second = failed_beta("b@example.com");
        let persisted = failed_beta("c@example.com").with_status(SubmissionStatus::Persisted);
        let records = vec![first.clone(), second.clone(), persisted, first.replayed()];

        assert_eq!(pending_replays(&records), vec![second]);
    }

    #[tokio::test]
    async fn test_resubmit_appends_replay_records() {
        let (backend, cache, retrier) = setup();
        let failed = failed_beta("jane@example.com");
        cache.append(failed.clone()).await.unwrap();

        let summary = resubmit(
            &cache,
            &retrier,
            FormKind::Beta,
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!(summary.replayed, 1);
        assert_eq!(backend.rows("beta_signups").await.len(), 1);

        let listed = cache.list(FormKind::Beta).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], failed);
        assert_eq!(listed[1].replay_of, Some(failed.client_id));
        assert_eq!(listed[1].status, SubmissionStatus::Persisted);
        assert_eq!(cache.counts().await.beta, 1);

        let again = resubmit(
            &cache,
            &retrier,
            FormKind::Beta,
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();
        assert_eq!(again, ReplaySummary::default());
    }

    #[tokio::test]
    async fn test_resubmit_of_landed_insert_is_success() {
        let (backend, cache, retrier) = setup();
        let failed = failed_beta("jane@example.com");
        cache.append(failed.clone()).await.unwrap();

        // the original attempt reached the database before its response was lost
        backend
            .insert(
                "beta_signups",
                serde_json::json!({
                    "client_id": failed.client_id,
                    "email": "jane@example.com",
                    "name": "Jane Doe",
                }),
            )
            .await
            .unwrap();

        let summary = resubmit(
            &cache,
            &retrier,
            FormKind::Beta,
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(backend.rows("beta_signups").await.len(), 1);
    }

    #[tokio::test]
    async fn test_resubmit_reports_duplicates() {
        let (_, cache, retrier) = setup();
        let landed = failed_beta("jane@example.com");
        let retry = failed_beta("jane@example.com");
        cache.append(landed).await.unwrap();
        cache.append(retry).await.unwrap();

        let summary = resubmit(
            &cache,
            &retrier,
            FormKind::Beta,
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(pending_replays(&cache.list(FormKind::Beta).await).len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_resubmit_stops() {
        let (backend, cache, retrier) = setup();
        cache.append(failed_beta("jane@example.com")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = resubmit(&cache, &retrier, FormKind::Beta, &cancel, &ProgressBar::hidden())
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(backend.rows("beta_signups").await.is_empty());
    }

    #[test]
    fn test_describe() {
        let record = failed_beta("jane@example.com");
        let line = describe(&record.replayed());

        assert!(line.contains("Persisted Jane Doe <jane@example.com>"));
        assert!(line.contains(&format!("replay of {}", record.client_id)));
    }
}
