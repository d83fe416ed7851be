use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormKind {
    Beta,
    Contact,
}

impl FormKind {
    pub const ALL: [FormKind; 2] = [FormKind::Beta, FormKind::Contact];

    pub fn as_str(self) -> &'static str {
        match self {
            FormKind::Beta => "beta",
            FormKind::Contact => "contact",
        }
    }

    /// Remote table holding this kind of submission.
    pub fn table(self) -> &'static str {
        match self {
            FormKind::Beta => "beta_signups",
            FormKind::Contact => "contacts",
        }
    }
}

impl fmt::Display for FormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beta" => Ok(FormKind::Beta),
            "contact" => Ok(FormKind::Contact),
            other => Err(format!("unknown form kind: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Developer,
    Recruiter,
    Both,
    Other,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Developer => "developer",
            Profile::Recruiter => "recruiter",
            Profile::Both => "both",
            Profile::Other => "other",
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "developer" => Ok(Profile::Developer),
            "recruiter" => Ok(Profile::Recruiter),
            "both" => Ok(Profile::Both),
            "other" => Ok(Profile::Other),
            other => Err(format!("unknown profile: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Persisted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormDetails {
    BetaSignup {
        profile: Profile,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expectations: Option<String>,
    },
    Contact {
        subject: String,
        message: String,
    },
}

impl FormDetails {
    pub fn kind(&self) -> FormKind {
        match self {
            FormDetails::BetaSignup { .. } => FormKind::Beta,
            FormDetails::Contact { .. } => FormKind::Contact,
        }
    }
}

/// One form submission as the page saw it.
///
/// `client_id` is minted once in [`SubmissionRecord::new`] and never reused.
/// Only `status` moves after creation, through [`SubmissionRecord::with_status`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub client_id: Uuid,
    pub name: String,
    pub email: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    #[serde(flatten)]
    pub details: FormDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<Uuid>,
}

impl SubmissionRecord {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        source: impl Into<String>,
        details: FormDetails,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            source: source.into(),
            created_at: Utc::now(),
            status: SubmissionStatus::Pending,
            details,
            replay_of: None,
        }
    }

    pub fn kind(&self) -> FormKind {
        self.details.kind()
    }

    pub fn with_status(mut self, status: SubmissionStatus) -> Self {
        self.status = status;
        self
    }

    /// Fresh record standing for a successful resubmission of `self`.
    pub fn replayed(&self) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            created_at: Utc::now(),
            status: SubmissionStatus::Persisted,
            replay_of: Some(self.client_id),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn beta() -> SubmissionRecord {
        SubmissionRecord::new(
            "Jane Doe",
            "jane@example.com",
            "landing_page",
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: Some("Des offres ciblées".to_string()),
            },
        )
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(beta().client_id, beta().client_id);
    }

    #[test]
    fn test_status_transition_keeps_identity() {
        let record = beta();
        let persisted = record.clone().with_status(SubmissionStatus::Persisted);

        assert_eq!(record.status, SubmissionStatus::Pending);
        assert_eq!(persisted.status, SubmissionStatus::Persisted);
        assert_eq!(persisted.client_id, record.client_id);
        assert_eq!(persisted.created_at, record.created_at);
    }

    #[test]
    fn test_replayed_points_back() {
        let failed = beta().with_status(SubmissionStatus::Failed);
        let replayed = failed.replayed();

        assert_ne!(replayed.client_id, failed.client_id);
        assert_eq!(replayed.replay_of, Some(failed.client_id));
        assert_eq!(replayed.status, SubmissionStatus::Persisted);
        assert_eq!(replayed.email, failed.email);
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(beta()).unwrap();

        assert_eq!(value["type"], json!("beta_signup"));
        assert_eq!(value["profile"], json!("developer"));
        assert_eq!(value["status"], json!("pending"));
        assert!(value.get("clientId").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("replayOf").is_none());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("both".parse::<Profile>(), Ok(Profile::Both));
        assert!("admin".parse::<Profile>().is_err());
        assert_eq!("contact".parse::<FormKind>(), Ok(FormKind::Contact));
        assert_eq!(FormKind::Beta.table(), "beta_signups");
    }
}
