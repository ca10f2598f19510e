//! Key-value bridge backed by redis.

use std::sync::Arc;

use async_trait::async_trait;
use bb8_redis::RedisConnectionManager;
use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::redis::AsyncCommands;
use tracing::{info, warn};

use modhost_common::{BackendConfig, BridgeError};

const BRIDGE: &str = "kv";

/// Operations the key-value bridge needs from its backend.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BridgeError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BridgeError>;
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_seconds: u64)
    -> Result<(), BridgeError>;
    async fn exists(&self, key: &str) -> Result<bool, BridgeError>;
    /// Number of keys removed (0 if absent).
    async fn del(&self, key: &str) -> Result<u64, BridgeError>;
}

/// Redis through a bb8 connection pool shared by every guest.
pub struct RedisBackend {
    pool: Pool<RedisConnectionManager>,
}

impl RedisBackend {
    /// Build the connection pool. Connections are opened lazily.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, BridgeError> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("redis://{url}")
        };

        let manager =
            RedisConnectionManager::new(url).map_err(|e| BridgeError::backend(BRIDGE, e))?;
        let pool = Pool::builder()
            .max_size(max_connections)
            .build(manager)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, BridgeError> {
        self.pool
            .get()
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BridgeError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BridgeError> {
        let mut conn = self.conn().await?;
        conn.set(key, value)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }

    async fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<(), BridgeError> {
        let mut conn = self.conn().await?;
        conn.set_ex(key, value, ttl_seconds)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, BridgeError> {
        let mut conn = self.conn().await?;
        conn.exists(key)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }

    async fn del(&self, key: &str) -> Result<u64, BridgeError> {
        let mut conn = self.conn().await?;
        conn.del(key)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))
    }
}

/// The key-value bridge. Disabled when no backend is configured.
#[derive(Clone, Default)]
pub struct KvBridge {
    backend: Option<Arc<dyn KvBackend>>,
}

impl KvBridge {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Connect to redis if an address is configured.
    ///
    /// A backend that cannot be set up leaves the bridge disabled; guests
    /// then get `Unavailable` from every call.
    pub async fn connect(config: &BackendConfig) -> Self {
        let Some(url) = config.url.as_deref().filter(|_| config.is_enabled()) else {
            info!("Key-value bridge disabled: no address configured");
            return Self::disabled();
        };

        match RedisBackend::connect(url, config.max_connections).await {
            Ok(backend) => {
                info!(max_connections = config.max_connections, "Key-value bridge enabled");
                Self::new(Arc::new(backend))
            }
            Err(e) => {
                warn!(error = %e, "Key-value bridge disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Result<&Arc<dyn KvBackend>, BridgeError> {
        self.backend
            .as_ref()
            .ok_or(BridgeError::Disabled { bridge: BRIDGE })
    }
}

impl std::fmt::Debug for KvBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_redis_url() -> Option<String> {
        let enabled = std::env::var("MODHOST_TEST_REDIS")
            .is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        if !enabled {
            return None;
        }
        std::env::var("REDIS_URL").ok()
    }

    #[tokio::test]
    async fn test_disabled_bridge() {
        let bridge = KvBridge::connect(&BackendConfig {
            url: None,
            max_connections: 4,
        })
        .await;

        assert!(!bridge.is_enabled());
        assert!(matches!(
            bridge.backend(),
            Err(BridgeError::Disabled { bridge: "kv" })
        ));
    }

    #[tokio::test]
    async fn test_redis_round_trip() {
        let Some(url) = live_redis_url() else {
            return;
        };

        let backend = RedisBackend::connect(&url, 2).await.unwrap();
        let key = format!("modhost:test:{}", uuid::Uuid::new_v4());

        assert_eq!(backend.get(&key).await.unwrap(), None);
        assert_eq!(backend.del(&key).await.unwrap(), 0);

        backend.set(&key, b"value".to_vec()).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), Some(b"value".to_vec()));
        assert!(backend.exists(&key).await.unwrap());

        backend.set_ex(&key, b"short".to_vec(), 60).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), Some(b"short".to_vec()));

        assert_eq!(backend.del(&key).await.unwrap(), 1);
        assert!(!backend.exists(&key).await.unwrap());
    }
}
