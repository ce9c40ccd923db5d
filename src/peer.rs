//! Peer controller RPC
//!
//! Synchronous calls to the other controller's daemon with a hard per-call
//! timeout. A timeout is reported as unreachable; callers treat that
//! conservatively (we may become master).

use crate::status::FailoverStatus;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Peer RPC errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Peer call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected peer response: {0}")]
    Protocol(String),
}

pub type PeerResult<T> = Result<T, PeerError>;

/// Calls the engine makes on the other controller
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// The peer's self-reported failover status
    async fn failover_status(&self) -> PeerResult<FailoverStatus>;

    /// Does the peer currently hold any pool?
    async fn pools_imported(&self) -> PeerResult<bool>;

    /// Ask the peer to recompute its status
    async fn refresh_status(&self) -> PeerResult<()>;
}

#[derive(Deserialize)]
struct StatusBody {
    status: FailoverStatus,
}

#[derive(Deserialize)]
struct PoolsBody {
    imported: bool,
}

/// HTTP client against the peer daemon's status surface
pub struct HttpPeer {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPeer {
    pub fn new(base_url: &str, timeout: Duration) -> PeerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Protocol(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    fn map_err(&self, err: reqwest::Error) -> PeerError {
        if err.is_timeout() {
            PeerError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            PeerError::Unreachable(err.to_string())
        } else {
            PeerError::Protocol(err.to_string())
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> PeerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Peer call GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if !response.status().is_success() {
            return Err(PeerError::Protocol(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response.json::<T>().await.map_err(|e| self.map_err(e))
    }
}

#[async_trait]
impl PeerClient for HttpPeer {
    async fn failover_status(&self) -> PeerResult<FailoverStatus> {
        Ok(self.get::<StatusBody>("/api/failover/status").await?.status)
    }

    async fn pools_imported(&self) -> PeerResult<bool> {
        Ok(self.get::<PoolsBody>("/api/failover/pools").await?.imported)
    }

    async fn refresh_status(&self) -> PeerResult<()> {
        let url = format!("{}/api/failover/status/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PeerError::Protocol(format!("{} returned {}", url, response.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Nothing listens on the discard port
        let peer = HttpPeer::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        let err = peer.failover_status().await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable(_) | PeerError::Timeout(_)));
    }

    #[test]
    fn test_base_url_trimmed() {
        let peer = HttpPeer::new("http://10.0.0.2:6080/", Duration::from_secs(1)).unwrap();
        assert_eq!(peer.base_url, "http://10.0.0.2:6080");
    }
}
