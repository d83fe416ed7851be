use std::sync::Arc;

use records::{FileStorage, Storage};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    cache::SubmissionCache,
    client::{RemoteClient, TableAnalytics},
    config::{BackendKind, Config, StorageKind},
    database::{RedisStorage, init_redis},
    error::{ConfigError, StartupError},
    guard::{FingerprintProvider, Guard, HeaderFingerprint, SessionStore},
    mailer::EdgeFunctionMailer,
    notify::SubmitButtons,
    persistence::{Persistence, SimulatedBackend, SupabaseRest},
    pipeline::FormPipeline,
    retry::Retrier,
};

pub struct State {
    pub config: Config,
    pub pipeline: FormPipeline,
    pub persistence: Arc<dyn Persistence>,
    pub sessions: Arc<SessionStore>,
    pub cache: Arc<SubmissionCache>,
    pub buttons: SubmitButtons,
    pub fingerprint: Arc<dyn FingerprintProvider>,
    pub shutdown: CancellationToken,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, StartupError> {
        let persistence = init_persistence(&config)?;
        let storage = init_storage(&config).await?;

        let cache = Arc::new(SubmissionCache::new(storage, config.namespace.clone()));
        cache.load().await?;

        let sessions = Arc::new(SessionStore::new());
        let analytics = Arc::new(TableAnalytics::new(persistence.clone()));
        let client = RemoteClient::new(persistence.clone(), analytics.clone());
        let retrier = Retrier::new(Arc::new(client), config.retry.clone());

        let mut pipeline = FormPipeline::new(
            Guard::new(config.rate.clone(), config.bot.clone()),
            sessions.clone(),
            retrier,
            cache.clone(),
        )
        .with_analytics(analytics)
        .cache_failed(config.cache_failed);

        if let Some(url) = &config.email_function_url {
            info!("Confirmation mails enabled");
            let mailer = EdgeFunctionMailer::new(
                url,
                config.supabase_key.as_deref(),
                config.retry.attempt_timeout,
            )
            .map_err(ConfigError::from)?;
            pipeline = pipeline.with_mailer(Arc::new(mailer), config.admin_email.clone());
        }

        Ok(Arc::new(Self {
            config,
            pipeline,
            persistence,
            sessions,
            cache,
            buttons: SubmitButtons::new(),
            fingerprint: Arc::new(HeaderFingerprint),
            shutdown: CancellationToken::new(),
        }))
    }
}

pub fn init_persistence(config: &Config) -> Result<Arc<dyn Persistence>, ConfigError> {
    match config.backend {
        BackendKind::Supabase => {
            let url = config
                .supabase_url
                .as_deref()
                .ok_or(ConfigError::Missing("SUPABASE_URL"))?;
            let key = config
                .supabase_key
                .as_deref()
                .ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?;

            info!("Persisting submissions to Supabase at {url}");
            Ok(Arc::new(SupabaseRest::new(
                url,
                key,
                config.retry.attempt_timeout,
            )?))
        }
        BackendKind::Simulated => {
            info!(
                latency_ms = config.simulated_latency.as_millis() as u64,
                failure_rate = config.simulated_failure_rate,
                "Persisting submissions to the simulated backend"
            );
            Ok(Arc::new(SimulatedBackend::new(
                config.simulated_latency,
                config.simulated_failure_rate,
            )))
        }
    }
}

pub async fn init_storage(config: &Config) -> Result<Arc<dyn Storage>, StartupError> {
    match config.storage {
        StorageKind::File => {
            info!("Caching submissions under {}", config.storage_dir.display());
            Ok(Arc::new(FileStorage::open(&config.storage_dir).await?))
        }
        StorageKind::Redis => {
            info!("Caching submissions in Redis");
            let connection = init_redis(&config.redis_url).await?;
            Ok(Arc::new(RedisStorage::new(connection)))
        }
    }
}
