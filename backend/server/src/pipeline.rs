//! # Submission Pipeline
//!
//! One form submission from raw fields to a user-facing result:
//!
//! 1. Sanitize every field
//! 2. Validate, nothing leaves the process on failure
//! 3. Guard: CSRF, rate limit, bot score against the caller's session; a
//!    rejection is reported as a `security_alert` analytics event
//! 4. Build a pending record with a fresh `client_id`
//! 5. Submit with retries
//! 6. Cache the outcome and send confirmation mails, both best effort
use std::sync::Arc;

use records::{FormDetails, FormKind, Profile, SubmissionRecord, SubmissionStatus};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cache::SubmissionCache,
    client::{Analytics, SubmissionContext, SubmissionOutcome, normalize, security_alert_event},
    error::FormError,
    guard::{BotSignals, Guard, GuardRequest, SESSION_UNKNOWN, SessionStore},
    mailer::{Mailer, confirmations},
    retry::Retrier,
    validator::{PROFILE_INVALID, RawFields, validate},
};

pub const SOURCE: &str = "landing_page";

pub struct SubmissionRequest {
    pub kind: FormKind,
    pub session_id: Uuid,
    pub csrf_token: String,
    pub fields: RawFields,
    pub signals: BotSignals,
    pub context: SubmissionContext,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub kind: FormKind,
    pub client_id: Uuid,
    pub server_id: String,
    pub message: String,
}

pub struct FormPipeline {
    pub guard: Guard,
    pub sessions: Arc<SessionStore>,
    pub retrier: Retrier,
    pub cache: Arc<SubmissionCache>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub analytics: Option<Arc<dyn Analytics>>,
    pub admin_email: Option<String>,
    pub cache_failed: bool,
}

impl FormPipeline {
    pub fn new(
        guard: Guard,
        sessions: Arc<SessionStore>,
        retrier: Retrier,
        cache: Arc<SubmissionCache>,
    ) -> Self {
        Self {
            guard,
            sessions,
            retrier,
            cache,
            mailer: None,
            analytics: None,
            admin_email: None,
            cache_failed: true,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>, admin_email: Option<String>) -> Self {
        self.mailer = Some(mailer);
        self.admin_email = admin_email;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn Analytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn cache_failed(mut self, enabled: bool) -> Self {
        self.cache_failed = enabled;
        self
    }

    pub async fn submit(
        &self,
        request: SubmissionRequest,
        cancel: &CancellationToken,
    ) -> Result<Receipt, FormError> {
        let kind = request.kind;
        let fields = self.guard.sanitize_fields(&request.fields);

        let validation = validate(kind, &fields);
        if !validation.valid {
            info!("{kind} submission failed validation: {:?}", validation.errors);
            return Err(FormError::Validation(validation.errors));
        }

        let target = format!("/{kind}");
        let guard_request = GuardRequest {
            method: "POST",
            target: &target,
            csrf_token: &request.csrf_token,
            user_agent: &request.context.user_agent,
            signals: &request.signals,
        };
        let verdict = self
            .sessions
            .with_session(request.session_id, |session| {
                self.guard
                    .check_submission(&guard_request, session, Instant::now().into_std())
            })
            .ok_or_else(|| {
                warn!(session = %request.session_id, "Submission from unknown session");
                let reasons = vec![SESSION_UNKNOWN.to_string()];
                self.alert(kind, &reasons, None, &request.context);
                FormError::Security(reasons)
            })?;
        if !verdict.allow {
            self.alert(kind, &verdict.reasons, Some(verdict.score), &request.context);
            return Err(FormError::Security(verdict.reasons));
        }

        let record = normalize(&build_record(kind, fields)?);
        let outcome = self
            .retrier
            .submit_with_retry(&record, &request.context, cancel)
            .await?;

        match outcome {
            SubmissionOutcome::Success { server_id, message } => {
                let persisted = record.with_status(SubmissionStatus::Persisted);
                self.remember(persisted.clone()).await;
                self.confirm(&persisted);

                Ok(Receipt {
                    kind,
                    client_id: persisted.client_id,
                    server_id,
                    message,
                })
            }
            SubmissionOutcome::DuplicateRejected { message } => Err(FormError::Duplicate(message)),
            SubmissionOutcome::TransientFailure { cause } => {
                if self.cache_failed {
                    self.remember(record.with_status(SubmissionStatus::Failed))
                        .await;
                }
                Err(FormError::Transient(cause))
            }
            SubmissionOutcome::TerminalFailure { cause } => Err(FormError::Terminal(cause)),
        }
    }

    async fn remember(&self, record: SubmissionRecord) {
        let client_id = record.client_id;

        if let Err(e) = self.cache.append(record).await {
            error!(%client_id, "Local cache write failed: {e}");
        }
    }

    fn alert(&self, kind: FormKind, reasons: &[String], score: Option<f64>, ctx: &SubmissionContext) {
        if let Some(analytics) = &self.analytics {
            analytics.log_event(security_alert_event(kind, reasons, score, ctx));
        }
    }

    fn confirm(&self, record: &SubmissionRecord) {
        let Some(mailer) = &self.mailer else {
            return;
        };

        for mail in confirmations(record, self.admin_email.as_deref()) {
            mailer.send(mail);
        }
    }
}

fn build_record(kind: FormKind, fields: RawFields) -> Result<SubmissionRecord, FormError> {
    let details = match kind {
        FormKind::Beta => {
            let profile: Profile = fields
                .profile
                .as_deref()
                .unwrap_or_default()
                .parse()
                .map_err(|_| FormError::Validation(vec![PROFILE_INVALID.to_string()]))?;

            FormDetails::BetaSignup {
                profile,
                expectations: fields.expectations,
            }
        }
        FormKind::Contact => FormDetails::Contact {
            subject: fields.subject.unwrap_or_default(),
            message: fields.message.unwrap_or_default(),
        },
    };

    Ok(SubmissionRecord::new(fields.name, fields.email, SOURCE, details))
}
