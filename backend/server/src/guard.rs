//! # Security Guard
//!
//! Gate in front of the retry loop. Nothing here talks to the network, every
//! rejection is decided before a remote call is issued.
//!
//! ## Sessions
//! - A session is minted by `GET /session` and owns one CSRF token for its lifetime
//! - Rate-limit buckets live inside the session, keyed by (method, target)
//! - A bucket allows [`RateLimitConfig::max_requests`] requests, then resets once
//!   more than [`RateLimitConfig::window`] has elapsed since its first request
//!
//! ## Bot Score
//! Weighted sum of page signals, capped at 1.0:
//!
//! | signal                         | weight |
//! |--------------------------------|--------|
//! | no mouse movement              | 0.3    |
//! | no scroll                      | 0.2    |
//! | user agent has bot/crawler/spider | 0.4 |
//! | required fields filled < 3000ms | 0.4   |
//!
//! Blocked when the score is strictly above the threshold (0.7).
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    utils::{FieldType, sanitize},
    validator::RawFields,
};

pub const CSRF_INVALID: &str = "Token de sécurité invalide";
pub const RATE_LIMITED: &str = "Trop de requêtes. Veuillez patienter.";
pub const BOT_SUSPECTED: &str = "Activité suspecte détectée";
pub const SESSION_UNKNOWN: &str = "Session inconnue";

const SUSPICIOUS_AGENTS: [&str; 3] = ["bot", "crawler", "spider"];
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotScoreConfig {
    pub no_mouse_weight: f64,
    pub no_scroll_weight: f64,
    pub agent_weight: f64,
    pub rapid_fill_weight: f64,
    pub rapid_fill_ms: u64,
    pub threshold: f64,
}

impl Default for BotScoreConfig {
    fn default() -> Self {
        Self {
            no_mouse_weight: 0.3,
            no_scroll_weight: 0.2,
            agent_weight: 0.4,
            rapid_fill_weight: 0.4,
            rapid_fill_ms: 3000,
            threshold: 0.7,
        }
    }
}

/// Interaction signals collected by the page while the form was filled.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct BotSignals {
    #[serde(default)]
    pub mouse_moved: bool,
    #[serde(default)]
    pub scrolled: bool,
    /// Cumulative focus time across the required fields.
    #[serde(default)]
    pub fill_time_ms: u64,
}

pub fn bot_score(signals: &BotSignals, user_agent: &str, config: &BotScoreConfig) -> f64 {
    let mut score = 0.0;

    if !signals.mouse_moved {
        score += config.no_mouse_weight;
    }
    if !signals.scrolled {
        score += config.no_scroll_weight;
    }
    if is_suspicious_agent(user_agent) {
        score += config.agent_weight;
    }
    if signals.fill_time_ms < config.rapid_fill_ms {
        score += config.rapid_fill_weight;
    }

    // two decimals, so 0.3 + 0.4 lands on 0.7 and not 0.7000000000000001
    (score.min(1.0) * 100.0).round() / 100.0
}

pub fn is_suspicious_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    SUSPICIOUS_AGENTS.iter().any(|s| ua.contains(s))
}

pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

pub fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    started: Instant,
}

#[derive(Debug)]
pub struct SessionState {
    pub id: Uuid,
    pub csrf_token: String,
    pub last_seen: Instant,
    buckets: HashMap<(String, String), Bucket>,
}

impl SessionState {
    pub fn new(now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            csrf_token: generate_token(),
            last_seen: now,
            buckets: HashMap::new(),
        }
    }

    /// Counts one request against the (method, target) bucket; false once the
    /// bucket is full. Refused requests are not counted.
    pub fn record_request(
        &mut self,
        method: &str,
        target: &str,
        now: Instant,
        config: &RateLimitConfig,
    ) -> bool {
        let bucket = self
            .buckets
            .entry((method.to_string(), target.to_string()))
            .or_insert(Bucket {
                count: 0,
                started: now,
            });

        if now.saturating_duration_since(bucket.started) > config.window {
            bucket.count = 0;
            bucket.started = now;
        }

        if bucket.count >= config.max_requests {
            return false;
        }

        bucket.count += 1;
        true
    }
}

/// What the guard needs to know about one submission.
pub struct GuardRequest<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub csrf_token: &'a str,
    pub user_agent: &'a str,
    pub signals: &'a BotSignals,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GuardVerdict {
    pub allow: bool,
    pub reasons: Vec<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Guard {
    pub rate: RateLimitConfig,
    pub bot: BotScoreConfig,
}

impl Guard {
    pub fn new(rate: RateLimitConfig, bot: BotScoreConfig) -> Self {
        Self { rate, bot }
    }

    pub fn sanitize_fields(&self, fields: &RawFields) -> RawFields {
        let clean = |name: &str, value: &str| sanitize(value, FieldType::for_field(name));

        RawFields {
            name: clean("name", &fields.name),
            email: clean("email", &fields.email),
            profile: fields.profile.as_deref().map(|v| clean("profile", v)),
            expectations: fields.expectations.as_deref().map(|v| clean("expectations", v)),
            subject: fields.subject.as_deref().map(|v| clean("subject", v)),
            message: fields.message.as_deref().map(|v| clean("message", v)),
        }
    }

    pub fn check_submission(
        &self,
        request: &GuardRequest<'_>,
        session: &mut SessionState,
        now: Instant,
    ) -> GuardVerdict {
        let mut reasons = Vec::new();
        session.last_seen = now;

        if !tokens_match(&session.csrf_token, request.csrf_token) {
            reasons.push(CSRF_INVALID.to_string());
        }

        if !session.record_request(request.method, request.target, now, &self.rate) {
            reasons.push(RATE_LIMITED.to_string());
        }

        let score = bot_score(request.signals, request.user_agent, &self.bot);
        debug!(session = %session.id, score, "Bot score computed");
        if score > self.bot.threshold {
            reasons.push(format!("{BOT_SUSPECTED} (score {score:.2})"));
        }

        if !reasons.is_empty() {
            warn!(
                session = %session.id,
                target = request.target,
                ?reasons,
                "Submission rejected by guard"
            );
        }

        GuardVerdict {
            allow: reasons.is_empty(),
            reasons,
            score,
        }
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, SessionState>>,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Mints a session and prunes the ones idle for a day.
    ///
    /// At capacity, the least recently seen sessions make room.
    pub fn create(&self, now: Instant) -> (Uuid, String) {
        let session = SessionState::new(now);
        let issued = (session.id, session.csrf_token.clone());

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.retain(|_, s| now.saturating_duration_since(s.last_seen) < SESSION_TTL);

        while sessions.len() >= self.capacity {
            let Some(oldest) = sessions
                .values()
                .min_by_key(|s| s.last_seen)
                .map(|s| s.id)
            else {
                break;
            };
            debug!(session = %oldest, "Evicting least recently seen session");
            sessions.remove(&oldest);
        }
        sessions.insert(session.id, session);

        issued
    }

    pub fn with_session<T>(&self, id: Uuid, f: impl FnOnce(&mut SessionState) -> T) -> Option<T> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        sessions.get_mut(&id).map(f)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait FingerprintProvider: Send + Sync {
    fn fingerprint(&self, user_agent: &str, language: &str) -> String;
}

/// Hash of the request headers a browser always sends.
pub struct HeaderFingerprint;

impl FingerprintProvider for HeaderFingerprint {
    fn fingerprint(&self, user_agent: &str, language: &str) -> String {
        let digest = Sha256::digest(format!("{user_agent}|{language}").as_bytes());
        format!("fp_{}", hex::encode(&digest[..8]))
    }
}
