//! # Redis
//!
//! Optional home for the local cache when several form servers share it.
//!
//! ## Implementation
//!
//! - One string key per form kind, same names as the file cache
//! - Value is the whole JSON array, replaced with a single `SET`
//! - Updates are compare-and-set through a Lua script, retried while another
//!   replica wins the race
use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use records::{Storage, StorageError, Update};
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::debug;

const UPDATE_ATTEMPTS: usize = 16;

/// Sets `KEYS[1]` to `ARGV[3]` only if it still holds `ARGV[2]`, or is still
/// missing when `ARGV[1]` is `0`.
static COMPARE_AND_SET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if (ARGV[1] == '0' and current == false) or (ARGV[1] == '1' and current == ARGV[2]) then
            redis.call('SET', KEYS[1], ARGV[3])
            return 1
        end
        return 0
        ",
    )
});

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    client.get_connection_manager_with_config(config).await
}

#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
}

impl RedisStorage {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

fn unavailable(e: RedisError) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut connection = self.connection.clone();

        connection.get(key).await.map_err(unavailable)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();

        connection
            .set::<_, _, ()>(key, value)
            .await
            .map_err(unavailable)
    }

    async fn update(&self, key: &str, apply: Update<'_>) -> Result<String, StorageError> {
        let mut connection = self.connection.clone();

        for attempt in 1..=UPDATE_ATTEMPTS {
            let current: Option<String> = connection.get(key).await.map_err(unavailable)?;
            let next = apply(current.as_deref())?;

            let swapped: i32 = COMPARE_AND_SET
                .key(key)
                .arg(if current.is_some() { "1" } else { "0" })
                .arg(current.as_deref().unwrap_or_default())
                .arg(&next)
                .invoke_async(&mut connection)
                .await
                .map_err(unavailable)?;

            if swapped == 1 {
                return Ok(next);
            }
            debug!("Lost update race on {key}, attempt {attempt}");
        }

        Err(StorageError::Unavailable(format!(
            "{key} kept changing during update"
        )))
    }
}
