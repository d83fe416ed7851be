//! # Local Cache
//!
//! Bounded, append-only record of submissions per form kind.
//!
//! ## Implementation
//!
//! - One [`Mutex`] per kind so beta and contact appends never wait on each other
//! - Append re-reads the durable value through [`Storage::update`], so records
//!   written by another process (the replay tool, a second replica) survive
//! - A failed write leaves both copies untouched
//! - An unreadable durable value is moved to `<key>.corrupt` on load and never
//!   overwritten by an append
//! - [`CACHE_CAPACITY`] entries per kind, oldest evicted first
use std::{collections::VecDeque, sync::Arc};

use records::{
    CACHE_CAPACITY, FormDetails, FormKind, Profile, Storage, StorageError, SubmissionRecord,
    SubmissionStatus, decode_records, encode_records, storage_key,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProfileCounts {
    pub developer: usize,
    pub recruiter: usize,
    pub both: usize,
    pub other: usize,
}

impl ProfileCounts {
    fn add(&mut self, profile: Profile) {
        match profile {
            Profile::Developer => self.developer += 1,
            Profile::Recruiter => self.recruiter += 1,
            Profile::Both => self.both += 1,
            Profile::Other => self.other += 1,
        }
    }
}

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheCounts {
    pub beta: usize,
    pub contact: usize,
    pub total: usize,
    pub profiles: ProfileCounts,
}

pub fn quarantine_key(key: &str) -> String {
    format!("{key}.corrupt")
}

fn decode(key: &str, raw: &str) -> Result<VecDeque<SubmissionRecord>, StorageError> {
    decode_records(raw)
        .map(VecDeque::from)
        .map_err(|source| StorageError::Malformed {
            key: key.to_string(),
            source,
        })
}

pub struct SubmissionCache {
    storage: Arc<dyn Storage>,
    namespace: String,
    beta: Mutex<VecDeque<SubmissionRecord>>,
    contact: Mutex<VecDeque<SubmissionRecord>>,
}

impl SubmissionCache {
    pub fn new(storage: Arc<dyn Storage>, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            beta: Mutex::new(VecDeque::new()),
            contact: Mutex::new(VecDeque::new()),
        }
    }

    fn slot(&self, kind: FormKind) -> &Mutex<VecDeque<SubmissionRecord>> {
        match kind {
            FormKind::Beta => &self.beta,
            FormKind::Contact => &self.contact,
        }
    }

    fn key(&self, kind: FormKind) -> String {
        storage_key(&self.namespace, kind)
    }

    /// Reads both kinds back from storage.
    ///
    /// An unreadable value is appended to its quarantine key and the live key
    /// is reset, unless another writer replaced it in the meantime.
    pub async fn load(&self) -> Result<(), StorageError> {
        for kind in FormKind::ALL {
            let key = self.key(kind);
            let Some(raw) = self.storage.get(&key).await? else {
                continue;
            };

            let mut loaded = match decode(&key, &raw) {
                Ok(records) => records,
                Err(e) => {
                    error!("Quarantining unreadable cache entry {key}: {e}");
                    self.quarantine(&key, &raw).await?;
                    VecDeque::new()
                }
            };

            while loaded.len() > CACHE_CAPACITY {
                loaded.pop_front();
            }

            info!("Loaded {} cached {kind} submissions", loaded.len());
            *self.slot(kind).lock().await = loaded;
        }

        Ok(())
    }

    async fn quarantine(&self, key: &str, raw: &str) -> Result<(), StorageError> {
        self.storage
            .update(&quarantine_key(key), &|previous: Option<&str>| -> Result<String, StorageError> {
                Ok(match previous {
                    Some(previous) => format!("{previous}\n{raw}"),
                    None => raw.to_string(),
                })
            })
            .await?;

        self.storage
            .update(key, &|current: Option<&str>| -> Result<String, StorageError> {
                Ok(match current {
                    Some(current) if current != raw => current.to_string(),
                    _ => "[]".to_string(),
                })
            })
            .await?;

        Ok(())
    }

    /// Appends to the durable sequence as it is now, then mirrors it in memory.
    pub async fn append(&self, record: SubmissionRecord) -> Result<(), StorageError> {
        let kind = record.kind();
        let key = self.key(kind);
        let mut current = self.slot(kind).lock().await;

        let stored = self
            .storage
            .update(&key, &|raw: Option<&str>| -> Result<String, StorageError> {
                let mut records = match raw {
                    Some(raw) => decode(&key, raw)?,
                    None => VecDeque::new(),
                };
                records.push_back(record.clone());
                while records.len() > CACHE_CAPACITY {
                    records.pop_front();
                }

                encode_records(&records).map_err(|source| StorageError::Malformed {
                    key: key.clone(),
                    source,
                })
            })
            .await?;

        *current = decode(&key, &stored)?;
        Ok(())
    }

    pub async fn list(&self, kind: FormKind) -> Vec<SubmissionRecord> {
        self.slot(kind).lock().await.iter().cloned().collect()
    }

    /// Persisted records only, failed and pending ones are not user-visible.
    pub async fn counts(&self) -> CacheCounts {
        let persisted = |records: &VecDeque<SubmissionRecord>| {
            records
                .iter()
                .filter(|r| r.status == SubmissionStatus::Persisted)
                .count()
        };

        let mut profiles = ProfileCounts::default();
        let beta = {
            let records = self.beta.lock().await;
            for record in records.iter().filter(|r| r.status == SubmissionStatus::Persisted) {
                if let FormDetails::BetaSignup { profile, .. } = &record.details {
                    profiles.add(*profile);
                }
            }
            persisted(&*records)
        };
        let contact = persisted(&*self.contact.lock().await);

        CacheCounts {
            beta,
            contact,
            total: beta + contact,
            profiles,
        }
    }
}

#[cfg(test)]
mod tests {
    use records::MemoryStorage;

    use super::*;

    fn beta(n: usize) -> SubmissionRecord {
        SubmissionRecord::new(
            format!("User {n}"),
            format!("user{n}@example.com"),
            "landing_page",
            FormDetails::BetaSignup {
                profile: Profile::Developer,
                expectations: None,
            },
        )
        .with_status(SubmissionStatus::Persisted)
    }

    fn contact() -> SubmissionRecord {
        SubmissionRecord::new(
            "Jane Doe",
            "jane@example.com",
            "landing_page",
            FormDetails::Contact {
                subject: "support".to_string(),
                message: "Bonjour, une question sur la beta".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_keeps_last_hundred() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = SubmissionCache::new(storage.clone(), "opentalent");

        for n in 0..150 {
            cache.append(beta(n)).await.unwrap();
        }

        let listed = cache.list(FormKind::Beta).await;
        assert_eq!(listed.len(), CACHE_CAPACITY);
        assert_eq!(listed[0].name, "User 50");
        assert_eq!(listed[99].name, "User 149");

        let raw = storage
            .get("opentalent_beta_submissions")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_records(&raw).unwrap(), listed);
    }

    #[tokio::test]
    async fn test_offline_storage_leaves_memory_unchanged() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = SubmissionCache::new(storage.clone(), "opentalent");
        cache.append(beta(1)).await.unwrap();

        storage.set_offline(true);
        let result = cache.append(beta(2)).await;

        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(cache.list(FormKind::Beta).await.len(), 1);

        storage.set_offline(false);
        cache.append(beta(3)).await.unwrap();
        let names: Vec<_> = cache
            .list(FormKind::Beta)
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["User 1", "User 3"]);
    }

    #[tokio::test]
    async fn test_load_restores_both_kinds() {
        let storage = Arc::new(MemoryStorage::new());
        let first = SubmissionCache::new(storage.clone(), "opentalent");
        first.append(beta(1)).await.unwrap();
        first.append(contact()).await.unwrap();

        let second = SubmissionCache::new(storage, "opentalent");
        second.load().await.unwrap();

        assert_eq!(second.list(FormKind::Beta).await, first.list(FormKind::Beta).await);
        assert_eq!(
            second.list(FormKind::Contact).await,
            first.list(FormKind::Contact).await
        );
    }

    #[tokio::test]
    async fn test_load_quarantines_malformed_entry() {
        let storage = Arc::new(MemoryStorage::new());
        let truncated = encode_records(&[beta(1), beta(2)]).unwrap();
        let truncated = truncated[..truncated.len() - 10].to_string();
        storage
            .put("opentalent_beta_submissions", truncated.clone())
            .await
            .unwrap();

        let cache = SubmissionCache::new(storage.clone(), "opentalent");
        cache.load().await.unwrap();
        assert!(cache.list(FormKind::Beta).await.is_empty());

        cache.append(beta(3)).await.unwrap();

        assert_eq!(
            storage
                .get("opentalent_beta_submissions.corrupt")
                .await
                .unwrap(),
            Some(truncated)
        );
        assert_eq!(cache.list(FormKind::Beta).await.len(), 1);
    }

    #[tokio::test]
    async fn test_append_never_overwrites_malformed_entry() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = SubmissionCache::new(storage.clone(), "opentalent");
        storage
            .put("opentalent_beta_submissions", "[{\"name\":".to_string())
            .await
            .unwrap();

        let result = cache.append(beta(1)).await;

        assert!(matches!(result, Err(StorageError::Malformed { .. })));
        assert_eq!(
            storage.get("opentalent_beta_submissions").await.unwrap(),
            Some("[{\"name\":".to_string())
        );
        assert!(cache.list(FormKind::Beta).await.is_empty());
    }

    #[tokio::test]
    async fn test_append_keeps_records_from_another_writer() {
        let storage = Arc::new(MemoryStorage::new());
        let server = SubmissionCache::new(storage.clone(), "opentalent");
        let replay = SubmissionCache::new(storage.clone(), "opentalent");

        let failed = beta(1).with_status(SubmissionStatus::Failed);
        server.append(failed.clone()).await.unwrap();

        replay.load().await.unwrap();
        replay.append(failed.replayed()).await.unwrap();

        server.append(beta(2)).await.unwrap();

        let raw = storage
            .get("opentalent_beta_submissions")
            .await
            .unwrap()
            .unwrap();
        let stored = decode_records(&raw).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[1].replay_of, Some(failed.client_id));
        assert_eq!(server.list(FormKind::Beta).await, stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_lose_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(SubmissionCache::new(storage.clone(), "opentalent"));

        let tasks: Vec<_> = (0..50)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.append(beta(n)).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let listed = cache.list(FormKind::Beta).await;
        assert_eq!(listed.len(), 50);
        let raw = storage
            .get("opentalent_beta_submissions")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_records(&raw).unwrap(), listed);
    }

    #[tokio::test]
    async fn test_counts_only_persisted() {
        let cache = SubmissionCache::new(Arc::new(MemoryStorage::new()), "opentalent");
        cache.append(beta(1)).await.unwrap();
        cache.append(beta(2)).await.unwrap();
        cache
            .append(beta(3).with_status(SubmissionStatus::Failed))
            .await
            .unwrap();
        let mut recruiter = beta(4);
        recruiter.details = FormDetails::BetaSignup {
            profile: Profile::Recruiter,
            expectations: Some("Moins de spam".to_string()),
        };
        cache.append(recruiter).await.unwrap();
        cache
            .append(contact().with_status(SubmissionStatus::Failed))
            .await
            .unwrap();
        cache
            .append(contact().with_status(SubmissionStatus::Persisted))
            .await
            .unwrap();

        assert_eq!(
            cache.counts().await,
            CacheCounts {
                beta: 3,
                contact: 1,
                total: 4,
                profiles: ProfileCounts {
                    developer: 2,
                    recruiter: 1,
                    ..ProfileCounts::default()
                },
            }
        );
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let storage = Arc::new(MemoryStorage::new());
        let prod = SubmissionCache::new(storage.clone(), "opentalent");
        let staging = SubmissionCache::new(storage.clone(), "staging");
        prod.append(beta(1)).await.unwrap();

        staging.load().await.unwrap();
        assert!(staging.list(FormKind::Beta).await.is_empty());
    }
}
