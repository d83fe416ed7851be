//! # Records
//!
//! Shared shapes between the form server and the replay tool.
//!
//! ## Local Cache Layout
//! - One key per form kind: `<namespace>_<kind>_submissions`
//! - Value is a JSON array of [`SubmissionRecord`], oldest first
//! - At most [`CACHE_CAPACITY`] entries per key, older ones are evicted first
use serde_json::Error;

pub mod models;
pub mod storage;

pub use models::{FormDetails, FormKind, Profile, SubmissionRecord, SubmissionStatus};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError, Update};

pub const CACHE_CAPACITY: usize = 100;
pub const DEFAULT_NAMESPACE: &str = "opentalent";

pub fn storage_key(namespace: &str, kind: FormKind) -> String {
    format!("{namespace}_{}_submissions", kind.as_str())
}

pub fn decode_records(raw: &str) -> Result<Vec<SubmissionRecord>, Error> {
    serde_json::from_str(raw)
}

pub fn encode_records<'a, I>(records: I) -> Result<String, Error>
where
    I: IntoIterator<Item = &'a SubmissionRecord>,
{
    serde_json::to_string(&records.into_iter().collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        assert_eq!(
            storage_key(DEFAULT_NAMESPACE, FormKind::Beta),
            "opentalent_beta_submissions"
        );
        assert_eq!(
            storage_key("staging", FormKind::Contact),
            "staging_contact_submissions"
        );
    }

    #[test]
    fn test_decode_keeps_order() {
        let first = SubmissionRecord::new(
            "Jane Doe",
            "jane@example.com",
            "landing_page",
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: None,
            },
        );
        let second = SubmissionRecord::new(
            "John Doe",
            "john@example.com",
            "landing_page",
            FormDetails::Contact {
                subject: "partnership".to_string(),
                message: "Bonjour, parlons-en.".to_string(),
            },
        );

        let raw = encode_records([&first, &second]).unwrap();
        let decoded = decode_records(&raw).unwrap();

        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_records("not json").is_err());
        assert!(decode_records("{}").is_err());
    }
}
