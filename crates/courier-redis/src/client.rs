//! Redis client implementation with connection management

use crate::Result;
use redis::aio::ConnectionManager;

/// Redis client with automatic reconnection
///
/// Cloning is cheap: every clone multiplexes over the same managed connection.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to Redis server
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Mutable access for running raw commands, pipelines and scripts
    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }

    /// PING - Check the connection is alive
    pub async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    /// DEL - Delete one or more keys
    pub async fn del(&mut self, keys: &[&str]) -> Result<i64> {
        redis::cmd("DEL").arg(keys).query_async(&mut self.conn).await
    }

    /// EXISTS - Check if key exists
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        redis::cmd("EXISTS").arg(key).query_async(&mut self.conn).await
    }

    /// SET key value EX seconds
    pub async fn set_ex(&mut self, key: &str, value: &str, seconds: u64) -> Result<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut self.conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_basic_operations() -> Result<()> {
        let mut client = RedisClient::connect("redis://localhost:6379").await?;

        client.ping().await?;
        client.set_ex("courier_test_key", "value", 10).await?;
        assert!(client.exists("courier_test_key").await?);

        client.del(&["courier_test_key"]).await?;
        assert!(!client.exists("courier_test_key").await?);

        Ok(())
    }
}
