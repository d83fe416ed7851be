//! Confirmation e-mails, relayed through an edge function.
//!
//! Best effort only: a mail that fails to send is logged and forgotten, the
//! submission it confirms has already been stored.
use std::{sync::Arc, time::Duration};

use records::{FormDetails, SubmissionRecord};
use reqwest::Client;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub const BETA_SUBJECT: &str = "Bienvenue dans la beta OpenTalent";
pub const CONTACT_SUBJECT: &str = "Nous avons bien reçu votre message";
pub const ADMIN_SUBJECT: &str = "Nouveau message de contact";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    BetaSignup,
    ContactReceived,
    AdminNotification,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub data: EmailData,
}

pub trait Mailer: Send + Sync {
    fn send(&self, request: EmailRequest);
}

/// Mails owed for one persisted record.
pub fn confirmations(record: &SubmissionRecord, admin_email: Option<&str>) -> Vec<EmailRequest> {
    let greeting = EmailData {
        name: Some(record.name.clone()),
        ..EmailData::default()
    };

    match &record.details {
        FormDetails::BetaSignup { .. } => vec![EmailRequest {
            to: record.email.clone(),
            subject: BETA_SUBJECT.to_string(),
            kind: EmailKind::BetaSignup,
            data: greeting,
        }],
        FormDetails::Contact { message, .. } => {
            let mut mails = vec![EmailRequest {
                to: record.email.clone(),
                subject: CONTACT_SUBJECT.to_string(),
                kind: EmailKind::ContactReceived,
                data: greeting,
            }];

            if let Some(admin) = admin_email {
                mails.push(EmailRequest {
                    to: admin.to_string(),
                    subject: format!("{ADMIN_SUBJECT} de {}", record.name),
                    kind: EmailKind::AdminNotification,
                    data: EmailData {
                        name: Some(record.name.clone()),
                        email: Some(record.email.clone()),
                        message: Some(message.clone()),
                    },
                });
            }

            mails
        }
    }
}

pub struct EdgeFunctionMailer {
    client: Client,
    function_url: String,
    anon_key: Option<Arc<str>>,
}

impl EdgeFunctionMailer {
    pub fn new(
        function_url: &str,
        anon_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            function_url: function_url.to_string(),
            anon_key: anon_key.map(Arc::from),
        })
    }
}

impl Mailer for EdgeFunctionMailer {
    fn send(&self, request: EmailRequest) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime for {:?} mail, dropped", request.kind);
            return;
        };

        let mut call = self.client.post(&self.function_url).json(&request);
        if let Some(key) = &self.anon_key {
            call = call.bearer_auth(key);
        }

        handle.spawn(async move {
            match call.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Sent {:?} mail", request.kind);
                }
                Ok(response) => {
                    warn!("Mail {:?} refused: HTTP {}", request.kind, response.status());
                }
                Err(e) => warn!("Mail {:?} not sent: {e}", request.kind),
            }
        });
    }
}
