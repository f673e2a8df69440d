//! Redis Upstream Adapter
//!
//! Implements the upstream ports over a multiplexed Redis connection.
//!
//! Key/value, list and sorted-set commands share one multiplexed connection. Redis
//! requires a dedicated socket in subscriber mode, so [`UpstreamStore::subscribe`]
//! opens a pub/sub connection from the same client; it belongs to the handle
//! that created it and closes when its stream is dropped.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::application::ports::{
    MessageStream, UpstreamConnector, UpstreamError, UpstreamHandle, UpstreamMessage,
    UpstreamStore,
};

/// Map a Redis error onto the upstream taxonomy.
fn map_error(err: &redis::RedisError) -> UpstreamError {
    if err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        UpstreamError::Connection(err.to_string())
    } else if err.kind() == redis::ErrorKind::TypeError {
        UpstreamError::InvalidData(err.to_string())
    } else {
        UpstreamError::Command(err.to_string())
    }
}

/// `LPOP` + `ZADD` in one step, so a claimed id is always in exactly one of the two keys.
static POP_TO_SORTED: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local id = redis.call('LPOP', KEYS[1])
        if id then
            redis.call('ZADD', KEYS[2], ARGV[1], id)
        end
        return id
        ",
    )
});

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// =============================================================================
// Connector
// =============================================================================

/// Opens Redis connections for the connection manager.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Arc<redis::Client>,
    endpoint: String,
}

impl RedisConnector {
    /// Parse a `redis://[:password@]host:port[/db]` URL.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidData`] if the URL cannot be parsed.
    pub fn open(url: &str) -> Result<Self, UpstreamError> {
        let client = redis::Client::open(url)
            .map_err(|e| UpstreamError::InvalidData(format!("invalid Redis URL: {e}")))?;
        let info = client.get_connection_info();
        let endpoint = format!("redis://{}/{}", info.addr, info.redis.db);

        Ok(Self {
            client: Arc::new(client),
            endpoint,
        })
    }
}

#[async_trait]
impl UpstreamConnector for RedisConnector {
    async fn connect(&self) -> Result<UpstreamHandle, UpstreamError> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_error(&e))?;

        tracing::debug!(endpoint = %self.endpoint, "Redis connection opened");
        Ok(Arc::new(RedisStore {
            client: self.client.clone(),
            connection,
        }))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

// =============================================================================
// Store
// =============================================================================

/// One live Redis connection.
pub struct RedisStore {
    client: Arc<redis::Client>,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl UpstreamStore for RedisStore {
    async fn ping(&self) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(&e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, UpstreamError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await.map_err(|e| map_error(&e))?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => conn.pset_ex(key, value, ttl_millis(ttl)).await,
            None => conn.set(key, value).await,
        };
        result.map_err(|e| map_error(&e))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, UpstreamError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // An explicit MGET keeps the reply a list even for a single key.
        let mut conn = self.conn();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error(&e))?;
        Ok(values)
    }

    async fn delete(&self, key: &str) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let _: i64 = conn.del(key).await.map_err(|e| map_error(&e))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| map_error(&e))?;
        tracing::trace!(channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream, UpstreamError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_error(&e))?;

        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|e| map_error(&e))?;
        }

        let stream = pubsub.into_on_message().filter_map(|message| {
            let channel = message.get_channel_name().to_string();
            let decoded = match message.get_payload::<String>() {
                Ok(payload) => Some(UpstreamMessage { channel, payload }),
                Err(error) => {
                    tracing::warn!(%channel, error = %error, "Dropping undecodable Redis message");
                    None
                }
            };
            futures::future::ready(decoded)
        });
        Ok(stream.boxed())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let _: i64 = conn.rpush(key, value).await.map_err(|e| map_error(&e))?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, UpstreamError> {
        let mut conn = self.conn();
        let len: usize = conn.llen(key).await.map_err(|e| map_error(&e))?;
        Ok(len)
    }

    async fn list_pop_to_sorted(
        &self,
        list: &str,
        claims: &str,
        claimed_at_ms: u64,
    ) -> Result<Option<String>, UpstreamError> {
        let mut conn = self.conn();
        let id: Option<String> = POP_TO_SORTED
            .key(list)
            .key(claims)
            .arg(claimed_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_error(&e))?;
        Ok(id)
    }

    async fn sorted_members_upto(
        &self,
        key: &str,
        max_score: u64,
    ) -> Result<Vec<String>, UpstreamError> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .zrangebyscore(key, "-inf", max_score)
            .await
            .map_err(|e| map_error(&e))?;
        Ok(members)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), UpstreamError> {
        let mut conn = self.conn();
        let _: i64 = conn.zrem(key, member).await.map_err(|e| map_error(&e))?;
        Ok(())
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, UpstreamError> {
        let mut conn = self.conn();
        let len: usize = conn.zcard(key).await.map_err(|e| map_error(&e))?;
        Ok(len)
    }
}
