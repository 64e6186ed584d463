//! Redis implementation of the primary cache tier

use crate::tiered_cache::{CacheError, PrimaryStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// Primary store backed by a single multiplexed Redis connection
///
/// The connection is opened by the first [`ping`](PrimaryStore::ping) and shared by
/// every caller afterwards; `MultiplexedConnection` is cheap to clone.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisStore {
    /// Parse the URL without connecting
    pub fn open(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(RedisStore {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| CacheError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

fn op_error(e: redis::RedisError) -> CacheError {
    CacheError::Operation(e.to_string())
}

#[async_trait]
impl PrimaryStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        debug!("Redis answered ping: {}", pong);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(op_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        // Redis rejects EX 0
        let seconds = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(op_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(op_error)?;
        Ok(())
    }
}
