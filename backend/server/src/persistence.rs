//! # Persistence
//!
//! The hosted backend-as-a-service that stores submissions, seen as two calls:
//! `insert(table, row)` and `select_eq(table, column, value)`.
//!
//! Two implementations, picked by `FORMS_BACKEND`:
//! - [`SupabaseRest`]: PostgREST endpoint of a Supabase project
//! - [`SimulatedBackend`]: in-memory tables with the same unique constraints,
//!   optional latency and random outages, for local runs and demos
//!
//! ## Error Classes
//! - SQLSTATE `23505`: unique violation
//! - HTTP 400/422, SQLSTATE class `22` or `23`: the remote side refused the data
//! - anything else (5xx, 429, transport, timeouts): unavailable, worth retrying
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use records::FormKind;
use reqwest::{
    Client, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue},
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

pub const UNIQUE_VIOLATION: &str = "23505";
pub const ANALYTICS_TABLE: &str = "analytics_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UniqueViolation,
    Validation,
    Unavailable,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?} [{code}]: {message}")]
pub struct PersistenceError {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl PersistenceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unavailable,
            code: String::new(),
            message: message.into(),
            details: None,
        }
    }

    pub fn classify(status: u16, code: &str, message: String, details: Option<String>) -> Self {
        let kind = if code == UNIQUE_VIOLATION {
            FailureKind::UniqueViolation
        } else if status == 400 || status == 422 || code.starts_with("22") || code.starts_with("23")
        {
            FailureKind::Validation
        } else {
            FailureKind::Unavailable
        };

        Self {
            kind,
            code: code.to_string(),
            message,
            details,
        }
    }

    /// Whether the message or details name `column`, e.g. the violated constraint.
    pub fn mentions(&self, column: &str) -> bool {
        self.message.contains(column)
            || self.details.as_deref().is_some_and(|d| d.contains(column))
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Inserts one row and returns it as stored, server assigned `id` included.
    async fn insert(&self, table: &str, row: Value) -> Result<Value, PersistenceError>;

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, PersistenceError>;
}

/// One single-row read against the beta table, timed.
pub async fn check_health(persistence: &dyn Persistence) -> Result<Duration, PersistenceError> {
    let started = Instant::now();
    persistence
        .select_eq(FormKind::Beta.table(), "id", "0", 1)
        .await?;

    Ok(started.elapsed())
}

#[derive(Deserialize, Default)]
struct PostgrestError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    details: Option<String>,
}

pub struct SupabaseRest {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseRest {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn headers(&self) -> Result<HeaderMap, PersistenceError> {
        let invalid = |e: InvalidHeaderValue| {
            PersistenceError::unavailable(format!("invalid api key header: {e}"))
        };

        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&self.anon_key).map_err(invalid)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.anon_key)).map_err(invalid)?,
        );
        headers.insert(
            "X-Client-Info",
            HeaderValue::from_static("opentalent-landing-page"),
        );

        Ok(headers)
    }

    async fn read_rows(response: reqwest::Response) -> Result<Vec<Value>, PersistenceError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Vec<Value>>()
                .await
                .map_err(|e| PersistenceError::unavailable(format!("unreadable response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        let error: PostgrestError = serde_json::from_str(&body).unwrap_or_default();
        let message = if error.message.is_empty() {
            format!("HTTP {status}: {body}")
        } else {
            error.message
        };

        Err(PersistenceError::classify(
            status.as_u16(),
            &error.code,
            message,
            error.details,
        ))
    }
}

#[async_trait]
impl Persistence for SupabaseRest {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, PersistenceError> {
        let response = self
            .client
            .post(self.table_url(table))
            .headers(self.headers()?)
            .header("Prefer", "return=representation")
            .json(&[row])
            .send()
            .await
            .map_err(|e| PersistenceError::unavailable(format!("insert into {table}: {e}")))?;

        Self::read_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::unavailable(format!("{table} returned no row")))
    }

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, PersistenceError> {
        let response = self
            .client
            .get(self.table_url(table))
            .headers(self.headers()?)
            .query(&[
                ("select", "id,client_id".to_string()),
                (column, format!("eq.{value}")),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PersistenceError::unavailable(format!("select from {table}: {e}")))?;

        Self::read_rows(response).await
    }
}

pub struct SimulatedBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    latency: Duration,
    failure_rate: f64,
    next_id: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().await.get(table).cloned().unwrap_or_default()
    }

    fn unique_columns(table: &str) -> &'static [&'static str] {
        match table {
            "beta_signups" => &["email", "client_id"],
            ANALYTICS_TABLE => &[],
            _ => &["client_id"],
        }
    }

    async fn network(&self) -> Result<(), PersistenceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate {
            return Err(PersistenceError::classify(
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                "",
                "Service temporairement indisponible".to_string(),
                None,
            ));
        }

        Ok(())
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(Duration::ZERO, 0.0)
    }
}

#[async_trait]
impl Persistence for SimulatedBackend {
    async fn insert(&self, table: &str, mut row: Value) -> Result<Value, PersistenceError> {
        self.network().await?;

        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();

        for column in Self::unique_columns(table) {
            let Some(value) = row.get(*column).filter(|v| !v.is_null()) else {
                continue;
            };

            if rows.iter().any(|r| r.get(*column) == Some(value)) {
                return Err(PersistenceError::classify(
                    StatusCode::CONFLICT.as_u16(),
                    UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint \"{table}_{column}_key\""),
                    Some(format!("Key ({column})=({value}) already exists.")),
                ));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(fields) = row.as_object_mut() {
            fields.insert("id".to_string(), json!(id));
            fields.insert("created_at".to_string(), json!(Utc::now()));
        }

        debug!("Simulated insert into {table} with id {id}");
        rows.push(row.clone());

        Ok(row)
    }

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, PersistenceError> {
        self.network().await?;

        let tables = self.tables.lock().await;
        let matches: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get(column).and_then(Value::as_str) == Some(value))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let unique = PersistenceError::classify(409, "23505", "dup".into(), None);
        assert_eq!(unique.kind, FailureKind::UniqueViolation);

        let not_null = PersistenceError::classify(400, "23502", "null name".into(), None);
        assert_eq!(not_null.kind, FailureKind::Validation);

        let bad_text = PersistenceError::classify(500, "22P02", "bad uuid".into(), None);
        assert_eq!(bad_text.kind, FailureKind::Validation);

        let bad_column = PersistenceError::classify(400, "PGRST204", "no column".into(), None);
        assert_eq!(bad_column.kind, FailureKind::Validation);

        for status in [500, 502, 503, 429] {
            let err = PersistenceError::classify(status, "", "down".into(), None);
            assert_eq!(err.kind, FailureKind::Unavailable, "{status}");
        }
    }

    #[test]
    fn test_mentions() {
        let err = PersistenceError::classify(
            409,
            UNIQUE_VIOLATION,
            "duplicate key value violates unique constraint \"contacts_client_id_key\"".into(),
            None,
        );
        assert!(err.mentions("client_id"));
        assert!(!err.mentions("email"));

        let err = PersistenceError::classify(
            409,
            UNIQUE_VIOLATION,
            "duplicate key".into(),
            Some("Key (email)=(a@b.co) already exists.".into()),
        );
        assert!(err.mentions("email"));
    }

    #[tokio::test]
    async fn test_simulated_unique_email() {
        let backend = SimulatedBackend::default();

        let first = backend
            .insert("beta_signups", json!({"email": "jane@example.com", "client_id": "a"}))
            .await
            .unwrap();
        assert_eq!(first["id"], json!(1));

        let err = backend
            .insert("beta_signups", json!({"email": "jane@example.com", "client_id": "b"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::UniqueViolation);
        assert!(err.mentions("email"));

        // contacts only dedupe on client_id
        backend
            .insert("contacts", json!({"email": "jane@example.com", "client_id": "c"}))
            .await
            .unwrap();
        backend
            .insert("contacts", json!({"email": "jane@example.com", "client_id": "d"}))
            .await
            .unwrap();
        assert_eq!(backend.rows("contacts").await.len(), 2);
    }

    #[tokio::test]
    async fn test_simulated_select() {
        let backend = SimulatedBackend::default();
        backend
            .insert("beta_signups", json!({"email": "jane@example.com", "client_id": "a"}))
            .await
            .unwrap();

        let found = backend
            .select_eq("beta_signups", "email", "jane@example.com", 1)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let missing = backend
            .select_eq("beta_signups", "email", "john@example.com", 1)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let backend = SimulatedBackend::new(Duration::ZERO, 1.0);

        let err = backend
            .insert("contacts", json!({"client_id": "a"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unavailable);
    }
}
