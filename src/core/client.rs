//! Public cache operations
//!
//! Every call is exactly one request/response round trip per key on a
//! connection leased from the pool. CAS tokens always come from the caller;
//! the server alone decides whether a token matches, and a mismatch is
//! reported as `Ok(false)` rather than an error.

use crate::config::{CasMissingKey, Config, ConfigError};
use crate::core::connection::{ConnectionError, ConnectionSettings};
use crate::core::connection_pool::{ConnectionManager, ConnectionPool, PoolError};
use crate::core::metrics::{AtomicServerMetrics, MetricsSnapshot, ServerMetrics};
use crate::core::protocol::{
    ProtocolError, Request, Response, Status, MAX_KEY_LEN, MAX_VALUE_LEN,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A stored value together with its flags and CAS token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

/// Client for one cache server
#[derive(Debug)]
pub struct Client {
    pool: ConnectionPool,
    cas_missing_key: CasMissingKey,
    metrics: Arc<AtomicServerMetrics>,
}

impl Client {
    /// Build a client; no connection is opened until the first operation
    pub fn new(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let address = config.server_address()?;

        let metrics = Arc::new(AtomicServerMetrics::new(address.to_string()));
        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
        };
        let manager = ConnectionManager::new(
            address,
            settings,
            config.credentials.clone(),
            &config.connection_pool,
            Arc::clone(&metrics),
        );
        let pool = ConnectionPool::new(manager, &config.connection_pool)?;

        debug!(
            "Client for {} (socket timeout {:?}, cas on missing key: {:?})",
            pool.address(),
            settings.socket_timeout,
            config.cas_missing_key
        );

        Ok(Self {
            pool,
            cas_missing_key: config.cas_missing_key,
            metrics,
        })
    }

    /// Store `value` unconditionally
    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        expiration: u32,
    ) -> Result<bool, ClientError> {
        let (key, value) = (key.as_ref(), value.as_ref());
        validate_key(key)?;
        validate_value(value)?;

        let response = self.execute(Request::set(key, value, 0, expiration)).await?;
        self.store_outcome(response.status, false)
    }

    /// Fetch a value; a miss is `Ok(None)`
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(self.gets(key).await?.map(|item| item.value))
    }

    /// Fetch a value with its flags and CAS token
    pub async fn gets(&self, key: impl AsRef<[u8]>) -> Result<Option<Item>, ClientError> {
        let key = key.as_ref();
        validate_key(key)?;

        let response = self.execute(Request::get(key)).await?;
        match response.status {
            Status::Success => Ok(Some(Item {
                flags: response.flags.unwrap_or(0),
                cas: response.cas,
                value: response.value,
            })),
            Status::KeyNotFound => Ok(None),
            other => Err(status_error(other)),
        }
    }

    /// Store `value` only if the server's token for `key` equals `cas`
    ///
    /// What happens to a key that does not exist is governed by
    /// [`CasMissingKey`].
    pub async fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        cas: u64,
        expiration: u32,
    ) -> Result<bool, ClientError> {
        let (key, value) = (key.as_ref(), value.as_ref());
        validate_key(key)?;
        validate_value(value)?;

        let request = match self.cas_missing_key {
            CasMissingKey::Create => Request::set(key, value, 0, expiration),
            CasMissingKey::Reject => Request::replace(key, value, 0, expiration),
        };
        let response = self.execute(request.with_cas(cas)).await?;
        self.store_outcome(response.status, true)
    }

    /// Delete `key` unconditionally; `false` if it was absent
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool, ClientError> {
        let key = key.as_ref();
        validate_key(key)?;

        let response = self.execute(Request::delete(key)).await?;
        self.store_outcome(response.status, false)
    }

    /// Delete `key` only if the server's token equals `cas`
    pub async fn delete_cas(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<bool, ClientError> {
        let key = key.as_ref();
        validate_key(key)?;

        let response = self.execute(Request::delete(key).with_cas(cas)).await?;
        self.store_outcome(response.status, true)
    }

    /// Store many values; one independent round trip per key, results in input order
    pub async fn set_multi<K, V>(
        &self,
        items: &[(K, V)],
        expiration: u32,
    ) -> Result<Vec<bool>, ClientError>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        stream::iter(items)
            .map(|(key, value)| self.set(key.as_ref(), value.as_ref(), expiration))
            .buffered(self.pool.max_size().max(1))
            .try_collect()
            .await
    }

    /// Fetch many values; misses are left out of the result
    pub async fn get_multi<K>(&self, keys: &[K]) -> Result<HashMap<Vec<u8>, Vec<u8>>, ClientError>
    where
        K: AsRef<[u8]>,
    {
        let found: Vec<(Vec<u8>, Option<Vec<u8>>)> = stream::iter(keys)
            .map(|key| async move {
                let value = self.get(key.as_ref()).await?;
                Ok::<_, ClientError>((key.as_ref().to_vec(), value))
            })
            .buffer_unordered(self.pool.max_size().max(1))
            .try_collect()
            .await?;

        Ok(found
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }

    /// Round trip a no-op, useful as a health check
    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.execute(Request::noop()).await?;
        match response.status {
            Status::Success => Ok(()),
            other => Err(status_error(other)),
        }
    }

    /// Server version string
    pub async fn version(&self) -> Result<String, ClientError> {
        let response = self.execute(Request::version()).await?;
        match response.status {
            Status::Success => Ok(String::from_utf8_lossy(&response.value).into_owned()),
            other => Err(status_error(other)),
        }
    }

    /// Close every connection; later operations reconnect lazily
    pub fn disconnect_all(&self) {
        self.pool.disconnect_all();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start a fresh measurement window; open connections are still counted
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Connections currently owned by the pool
    pub fn open_connections(&self) -> usize {
        self.pool.size()
    }

    async fn execute(&self, request: Request) -> Result<Response, ClientError> {
        let start = Instant::now();
        let mut conn = self.pool.get().await?;

        match conn.send_command(request).await {
            Ok(response) => {
                self.metrics.record_success(start.elapsed());
                Ok(response)
            }
            Err(e) => {
                if matches!(e, ConnectionError::Timeout(_)) {
                    self.metrics.record_timeout();
                } else {
                    self.metrics.record_failure(Some(start.elapsed()));
                }
                Err(e.into())
            }
        }
    }

    fn store_outcome(&self, status: Status, conditional: bool) -> Result<bool, ClientError> {
        match status {
            Status::Success => Ok(true),
            Status::KeyExists | Status::KeyNotFound if conditional => {
                self.metrics.record_cas_mismatch();
                debug!("Conditional write refused: {}", status);
                Ok(false)
            }
            Status::KeyExists
            | Status::KeyNotFound
            | Status::NotStored
            | Status::ValueTooLarge
            | Status::InvalidArguments => {
                debug!("Write refused: {}", status);
                Ok(false)
            }
            other => Err(status_error(other)),
        }
    }
}

fn validate_key(key: &[u8]) -> Result<(), ClientError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(ClientError::InvalidKey(format!(
            "key length {} outside 1..={}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), ClientError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(ClientError::ValueTooLarge(value.len()));
    }
    Ok(())
}

fn status_error(status: Status) -> ClientError {
    match status {
        Status::AuthError => {
            ClientError::Authentication(format!("server refused the request: {}", status))
        }
        other => ClientError::Server(other),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server error: {0}")]
    Server(Status),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Value of {0} bytes exceeds the 1 MiB limit")]
    ValueTooLarge(usize),
    #[error("Timed out waiting for a free connection")]
    PoolTimeout,
    #[error("Connection pool error: {0}")]
    Pool(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ConnectionError> for ClientError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionFailed(msg) => ClientError::Connection(msg),
            ConnectionError::AuthenticationFailed(msg) => ClientError::Authentication(msg),
            ConnectionError::Timeout(limit) => ClientError::Timeout(limit),
            ConnectionError::Protocol(e) => ClientError::Protocol(e),
            ConnectionError::InvalidState(state) => {
                ClientError::Connection(format!("connection unusable in state {:?}", state))
            }
        }
    }
}

impl From<PoolError> for ClientError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Connection(e) => e.into(),
            PoolError::WaitTimeout => ClientError::PoolTimeout,
            PoolError::PoolCreationFailed(msg) | PoolError::PoolGetFailed(msg) => {
                ClientError::Pool(msg)
            }
        }
    }
}
