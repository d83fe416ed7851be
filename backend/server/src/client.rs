//! # Submission Client
//!
//! One attempt at persisting a submission, classified for the retry loop.
//!
//! ## Steps
//! 1. Normalize: trim everything, lowercase the email
//! 2. Beta only: look the email up first, a hit is a duplicate without an insert
//! 3. Insert the row, `client_id` included
//! 4. Classify: unique violation on `email` is a duplicate, refused data is
//!    terminal, anything else is transient
//!
//! A conflicting row that carries the same `client_id` means an earlier attempt
//! landed but its response was lost, so the attempt counts as a success.
//!
//! Analytics go out on success and never touch the outcome.
use std::sync::Arc;

use async_trait::async_trait;
use records::{FormDetails, FormKind, SubmissionRecord};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::{
    notify::{duplicate_message, success_message},
    persistence::{ANALYTICS_TABLE, FailureKind, Persistence, PersistenceError},
};

pub const SECURITY_ALERT: &str = "security_alert";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Success { server_id: String, message: String },
    DuplicateRejected { message: String },
    TransientFailure { cause: String },
    TerminalFailure { cause: String },
}

/// Who is submitting, carried alongside the record for analytics.
#[derive(Debug, Clone, Default)]
pub struct SubmissionContext {
    pub session_id: String,
    pub fingerprint: String,
    pub user_agent: String,
}

#[async_trait]
pub trait SubmissionClient: Send + Sync {
    async fn submit(&self, record: &SubmissionRecord, ctx: &SubmissionContext) -> SubmissionOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub name: String,
    pub payload: Value,
    pub fingerprint: String,
    pub session_id: String,
    pub user_agent: String,
}

/// Fire and forget: implementations must not block and must swallow their own errors.
pub trait Analytics: Send + Sync {
    fn log_event(&self, event: AnalyticsEvent);
}

/// Writes events into the `analytics_events` table on a background task.
pub struct TableAnalytics {
    persistence: Arc<dyn Persistence>,
}

impl TableAnalytics {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

impl Analytics for TableAnalytics {
    fn log_event(&self, event: AnalyticsEvent) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime for analytics event {}, dropped", event.name);
            return;
        };

        let persistence = self.persistence.clone();
        handle.spawn(async move {
            let row = json!({
                "event_name": event.name,
                "event_data": event.payload,
                "user_fingerprint": event.fingerprint,
                "session_id": event.session_id,
                "user_agent": event.user_agent,
            });

            if let Err(e) = persistence.insert(ANALYTICS_TABLE, row).await {
                warn!("Analytics event {} not logged: {e}", event.name);
            }
        });
    }
}

pub fn normalize(record: &SubmissionRecord) -> SubmissionRecord {
    let details = match &record.details {
        FormDetails::BetaSignup {
            profile,
            expectations,
        } => FormDetails::BetaSignup {
            profile: *profile,
            expectations: expectations
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        },
        FormDetails::Contact { subject, message } => FormDetails::Contact {
            subject: subject.trim().to_string(),
            message: message.trim().to_string(),
        },
    };

    SubmissionRecord {
        name: record.name.trim().to_string(),
        email: record.email.trim().to_lowercase(),
        source: record.source.trim().to_string(),
        details,
        ..record.clone()
    }
}

fn row(record: &SubmissionRecord) -> Value {
    let mut row = json!({
        "client_id": record.client_id,
        "name": record.name,
        "email": record.email,
        "source": record.source,
    });

    let extra = match &record.details {
        FormDetails::BetaSignup {
            profile,
            expectations,
        } => json!({ "profile": profile, "expectations": expectations }),
        FormDetails::Contact { subject, message } => {
            json!({ "subject": subject, "message": message, "status": "new" })
        }
    };

    if let (Some(row), Value::Object(extra)) = (row.as_object_mut(), extra) {
        row.extend(extra);
    }

    row
}

fn owned_by(row: &Value, record: &SubmissionRecord) -> bool {
    row.get("client_id").and_then(Value::as_str) == Some(record.client_id.to_string().as_str())
}

fn server_id(row: &Value, record: &SubmissionRecord) -> String {
    match row.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => record.client_id.to_string(),
    }
}

/// Live hint for the beta form; the insert's unique constraint stays authoritative.
pub async fn email_registered(
    persistence: &dyn Persistence,
    email: &str,
) -> Result<bool, PersistenceError> {
    let email = email.trim().to_lowercase();
    let rows = persistence
        .select_eq(FormKind::Beta.table(), "email", &email, 1)
        .await?;

    Ok(!rows.is_empty())
}

pub fn success_event(record: &SubmissionRecord, ctx: &SubmissionContext) -> AnalyticsEvent {
    let (name, payload) = match &record.details {
        FormDetails::BetaSignup {
            profile,
            expectations,
        } => (
            "beta_signup_success",
            json!({ "profile": profile, "has_expectations": expectations.is_some() }),
        ),
        FormDetails::Contact { subject, message } => (
            "contact_submit_success",
            json!({ "subject": subject, "message_length": message.chars().count() }),
        ),
    };

    AnalyticsEvent {
        name: name.to_string(),
        payload,
        fingerprint: ctx.fingerprint.clone(),
        session_id: ctx.session_id.clone(),
        user_agent: ctx.user_agent.clone(),
    }
}

/// A submission the guard turned away, kept for later review.
pub fn security_alert_event(
    kind: FormKind,
    reasons: &[String],
    score: Option<f64>,
    ctx: &SubmissionContext,
) -> AnalyticsEvent {
    AnalyticsEvent {
        name: SECURITY_ALERT.to_string(),
        payload: json!({
            "form": kind,
            "reasons": reasons,
            "bot_score": score,
            "user_agent": ctx.user_agent,
        }),
        fingerprint: ctx.fingerprint.clone(),
        session_id: ctx.session_id.clone(),
        user_agent: ctx.user_agent.clone(),
    }
}

pub struct RemoteClient {
    persistence: Arc<dyn Persistence>,
    analytics: Arc<dyn Analytics>,
    precheck_duplicates: bool,
}

impl RemoteClient {
    pub fn new(persistence: Arc<dyn Persistence>, analytics: Arc<dyn Analytics>) -> Self {
        Self {
            persistence,
            analytics,
            precheck_duplicates: true,
        }
    }

    pub fn without_precheck(mut self) -> Self {
        self.precheck_duplicates = false;
        self
    }

    /// Beta only: an existing row for the email settles the attempt without an insert.
    async fn precheck(&self, record: &SubmissionRecord) -> Option<SubmissionOutcome> {
        if record.kind() != FormKind::Beta || !self.precheck_duplicates {
            return None;
        }

        let rows = match self
            .persistence
            .select_eq(FormKind::Beta.table(), "email", &record.email, 1)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Duplicate pre-check failed, relying on insert: {e}");
                return None;
            }
        };

        let existing = rows.first()?;
        if owned_by(existing, record) {
            return Some(self.succeeded(record, existing));
        }

        info!("Beta signup {} rejected, email already registered", record.client_id);
        Some(SubmissionOutcome::DuplicateRejected {
            message: duplicate_message(record.kind()).to_string(),
        })
    }

    /// Tells "this exact record already landed" apart from a real duplicate.
    async fn resolve_conflict(
        &self,
        record: &SubmissionRecord,
        conflict: PersistenceError,
    ) -> SubmissionOutcome {
        let client_id = record.client_id.to_string();
        let on_client_id = conflict.mentions("client_id");

        match self
            .persistence
            .select_eq(record.kind().table(), "client_id", &client_id, 1)
            .await
        {
            Ok(rows) => match rows.first() {
                Some(stored) => {
                    info!("Submission {client_id} already stored by an earlier attempt");
                    self.succeeded(record, stored)
                }
                None if on_client_id => SubmissionOutcome::TransientFailure {
                    cause: format!("client_id {client_id} conflicts but is not visible yet"),
                },
                None => self.classify_failure(record, conflict),
            },
            Err(e) if on_client_id => SubmissionOutcome::TransientFailure {
                cause: e.to_string(),
            },
            Err(e) => {
                warn!("Conflict lookup for {client_id} failed: {e}");
                self.classify_failure(record, conflict)
            }
        }
    }

    fn succeeded(&self, record: &SubmissionRecord, stored: &Value) -> SubmissionOutcome {
        SubmissionOutcome::Success {
            server_id: server_id(stored, record),
            message: success_message(record.kind()).to_string(),
        }
    }

    fn classify_failure(&self, record: &SubmissionRecord, e: PersistenceError) -> SubmissionOutcome {
        match e.kind {
            FailureKind::UniqueViolation => SubmissionOutcome::DuplicateRejected {
                message: duplicate_message(record.kind()).to_string(),
            },
            FailureKind::Validation => SubmissionOutcome::TerminalFailure {
                cause: e.to_string(),
            },
            FailureKind::Unavailable => SubmissionOutcome::TransientFailure {
                cause: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl SubmissionClient for RemoteClient {
    async fn submit(&self, record: &SubmissionRecord, ctx: &SubmissionContext) -> SubmissionOutcome {
        let record = normalize(record);

        let outcome = match self.precheck(&record).await {
            Some(outcome) => outcome,
            None => match self.persistence.insert(record.kind().table(), row(&record)).await {
                Ok(stored) => self.succeeded(&record, &stored),
                Err(e) if e.kind == FailureKind::UniqueViolation => {
                    self.resolve_conflict(&record, e).await
                }
                Err(e) => self.classify_failure(&record, e),
            },
        };

        if matches!(outcome, SubmissionOutcome::Success { .. }) {
            self.analytics.log_event(success_event(&record, ctx));
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use records::Profile;

    use super::*;
    use crate::persistence::SimulatedBackend;

    #[derive(Default)]
    struct RecordingAnalytics {
        events: Mutex<Vec<AnalyticsEvent>>,
    }

    impl Analytics for RecordingAnalytics {
        fn log_event(&self, event: AnalyticsEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn beta(email: &str) -> SubmissionRecord {
        SubmissionRecord::new(
            " Jane Doe ",
            email,
            "landing_page",
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: Some("   ".to_string()),
            },
        )
    }

    fn setup() -> (Arc<SimulatedBackend>, Arc<RecordingAnalytics>, RemoteClient) {
        let backend = Arc::new(SimulatedBackend::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        let client = RemoteClient::new(backend.clone(), analytics.clone());

        (backend, analytics, client)
    }

    #[test]
    fn test_normalize() {
        let normalized = normalize(&beta("  Jane@Example.COM "));

        assert_eq!(normalized.name, "Jane Doe");
        assert_eq!(normalized.email, "jane@example.com");
        assert_eq!(
            normalized.details,
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: None,
            }
        );
    }

    #[tokio::test]
    async fn test_success_logs_analytics() {
        let (backend, analytics, client) = setup();

        let outcome = client
            .submit(&beta("jane@example.com"), &SubmissionContext::default())
            .await;

        assert_eq!(
            outcome,
            SubmissionOutcome::Success {
                server_id: "1".to_string(),
                message: success_message(FormKind::Beta).to_string(),
            }
        );
        let rows = backend.rows("beta_signups").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["profile"], "developer");

        let events = analytics.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "beta_signup_success");
        assert_eq!(events[0].payload["profile"], "developer");
        assert_eq!(events[0].payload["has_expectations"], false);
    }

    #[tokio::test]
    async fn test_email_registered() {
        let (backend, _, client) = setup();
        assert!(!email_registered(backend.as_ref(), "jane@example.com").await.unwrap());

        client
            .submit(&beta("jane@example.com"), &SubmissionContext::default())
            .await;

        assert!(email_registered(backend.as_ref(), " Jane@Example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_precheck_catches_duplicate() {
        let (backend, analytics, client) = setup();
        let ctx = SubmissionContext::default();

        client.submit(&beta("jane@example.com"), &ctx).await;
        let outcome = client.submit(&beta("JANE@example.com"), &ctx).await;

        assert_eq!(
            outcome,
            SubmissionOutcome::DuplicateRejected {
                message: duplicate_message(FormKind::Beta).to_string(),
            }
        );
        assert_eq!(backend.rows("beta_signups").await.len(), 1);
        assert_eq!(analytics.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_violation_without_precheck() {
        let (backend, _, client) = setup();
        let client = client.without_precheck();
        let ctx = SubmissionContext::default();

        client.submit(&beta("jane@example.com"), &ctx).await;
        let outcome = client.submit(&beta("jane@example.com"), &ctx).await;

        assert!(matches!(outcome, SubmissionOutcome::DuplicateRejected { .. }));
        assert_eq!(backend.rows("beta_signups").await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_client_id_resolves_as_success() {
        let (backend, _, client) = setup();
        let client = client.without_precheck();
        let ctx = SubmissionContext::default();
        let record = SubmissionRecord::new(
            "Jane Doe",
            "jane@example.com",
            "landing_page",
            FormDetails::Contact {
                subject: "partnership".to_string(),
                message: "Bonjour, parlons-en.".to_string(),
            },
        );

        let first = client.submit(&record, &ctx).await;
        let second = client.submit(&record, &ctx).await;

        assert_eq!(first, second);
        assert_eq!(backend.rows("contacts").await.len(), 1);
    }

    #[tokio::test]
    async fn test_landed_beta_is_not_a_duplicate() {
        let (backend, analytics, client) = setup();
        let ctx = SubmissionContext::default();
        let record = beta("jane@example.com");

        let first = client.submit(&record, &ctx).await;
        let retried = client.submit(&record, &ctx).await;
        let without_precheck = client.without_precheck().submit(&record, &ctx).await;

        assert!(matches!(first, SubmissionOutcome::Success { .. }));
        assert_eq!(retried, first);
        assert_eq!(without_precheck, first);
        assert_eq!(backend.rows("beta_signups").await.len(), 1);
        assert_eq!(analytics.events.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_outage_is_transient() {
        let analytics = Arc::new(RecordingAnalytics::default());
        let client = RemoteClient::new(
            Arc::new(SimulatedBackend::new(std::time::Duration::ZERO, 1.0)),
            analytics.clone(),
        );

        let outcome = client
            .submit(&beta("jane@example.com"), &SubmissionContext::default())
            .await;

        assert!(matches!(outcome, SubmissionOutcome::TransientFailure { .. }));
        assert!(analytics.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_contact_row_and_event() {
        let record = SubmissionRecord::new(
            "Jane Doe",
            "jane@example.com",
            "landing_page",
            FormDetails::Contact {
                subject: "support".to_string(),
                message: "Bonjour à vous".to_string(),
            },
        );

        let row = row(&record);
        assert_eq!(row["status"], "new");
        assert_eq!(row["client_id"], json!(record.client_id));

        let event = success_event(&record, &SubmissionContext::default());
        assert_eq!(event.name, "contact_submit_success");
        assert_eq!(event.payload["message_length"], 14);
    }
}
