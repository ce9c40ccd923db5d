//! Management plane collaborators
//!
//! Everything the transition bodies ask of the wider appliance (config
//! regeneration, workloads, alerts, dataset unlock) goes through
//! [`ControlPlane`]. The production client speaks a small JSON call protocol
//! to the local middleware.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Control plane errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Management plane unreachable: {0}")]
    Unreachable(String),

    #[error("Call {method} failed: {reason}")]
    Call { method: String, reason: String },

    #[error("Unexpected reply to {method}: {reason}")]
    Protocol { method: String, reason: String },
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Typed alerts raised by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// Fencing could not run or returned an unexpected code
    FencingFailed { reason: String },
    /// One or more pools failed to import during promotion
    PoolImportFailed { pools: Vec<String> },
    /// The watchdog rebooted the node during a demotion
    UnauthorizedReboot { at: DateTime<Utc> },
    /// We hold the pools while critical groups are still BACKUP
    AssumedMasterWithBackupInterfaces { groups: Vec<String> },
}

impl Alert {
    pub fn subject(&self) -> &'static str {
        match self {
            Alert::FencingFailed { .. } => "Failover fencing failed",
            Alert::PoolImportFailed { .. } => "Failover pool import failed",
            Alert::UnauthorizedReboot { .. } => "Unauthorized system reboot",
            Alert::AssumedMasterWithBackupInterfaces { .. } => "Failover WARNING",
        }
    }
}

/// Workloads and runtime state owned by the management plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Regenerate one group of runtime configuration (rc, ssl, cron, ...)
    async fn generate_etc(&self, group: &str) -> ControlResult<()>;

    async fn update_replication_tasks(&self) -> ControlResult<()>;

    /// Jails, VMs and auxiliary services marked start-on-boot
    async fn start_on_boot_workloads(&self) -> ControlResult<()>;

    /// Power off VMs and stop jails
    async fn stop_workloads(&self) -> ControlResult<()>;

    /// Invalidate the disk topology cache and resync disks and enclosures
    async fn sync_disks(&self) -> ControlResult<()>;

    /// Suppress failover alerts for `duration`
    async fn block_failover_alerts(&self, duration: Duration) -> ControlResult<()>;

    async fn initialize_alerts(&self) -> ControlResult<()>;

    async fn sync_key_escrow(&self) -> ControlResult<()>;

    /// Unlock encrypted datasets of a freshly imported pool
    async fn unlock_datasets(&self, pool: &str) -> ControlResult<()>;

    /// Unlock self-encrypting drives
    async fn sed_unlock_all(&self) -> ControlResult<()>;

    /// Is iSCSI ALUA enabled globally?
    async fn iscsi_alua_enabled(&self) -> ControlResult<bool>;

    async fn raise_alert(&self, alert: Alert) -> ControlResult<()>;
}

/// JSON call client against the local middleware
pub struct MiddlewareClient {
    url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CallReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl MiddlewareClient {
    pub fn new(base_url: &str, timeout: Duration) -> ControlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        Ok(Self {
            url: format!("{}/api/call", base_url.trim_end_matches('/')),
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> ControlResult<Value> {
        debug!("Management call {}", method);
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "method": method, "params": params }))
            .send()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        let reply: CallReply = response.json().await.map_err(|e| ControlError::Protocol {
            method: method.to_string(),
            reason: e.to_string(),
        })?;
        match reply.error {
            Some(reason) => Err(ControlError::Call {
                method: method.to_string(),
                reason,
            }),
            None => Ok(reply.result),
        }
    }

    async fn call_unit(&self, method: &str, params: Value) -> ControlResult<()> {
        self.call(method, params).await.map(|_| ())
    }
}

#[async_trait]
impl ControlPlane for MiddlewareClient {
    async fn generate_etc(&self, group: &str) -> ControlResult<()> {
        self.call_unit("etc.generate", json!([group])).await
    }

    async fn update_replication_tasks(&self) -> ControlResult<()> {
        self.call_unit("zettarepl.update_tasks", json!([])).await
    }

    async fn start_on_boot_workloads(&self) -> ControlResult<()> {
        self.call_unit("failover.start_on_boot_workloads", json!([])).await
    }

    async fn stop_workloads(&self) -> ControlResult<()> {
        self.call_unit("failover.stop_workloads", json!([])).await
    }

    async fn sync_disks(&self) -> ControlResult<()> {
        self.call_unit("disk.sync_all", json!([])).await?;
        self.call_unit("enclosure.sync_zpool", json!([])).await
    }

    async fn block_failover_alerts(&self, duration: Duration) -> ControlResult<()> {
        self.call_unit("alert.block_failover_alerts", json!([duration.as_secs()]))
            .await
    }

    async fn initialize_alerts(&self) -> ControlResult<()> {
        self.call_unit("alert.initialize", json!([])).await
    }

    async fn sync_key_escrow(&self) -> ControlResult<()> {
        self.call_unit("kmip.sync_keys", json!([])).await
    }

    async fn unlock_datasets(&self, pool: &str) -> ControlResult<()> {
        self.call_unit("pool.unlock_on_failover", json!([pool])).await
    }

    async fn sed_unlock_all(&self) -> ControlResult<()> {
        self.call_unit("disk.sed_unlock_all", json!([])).await
    }

    async fn iscsi_alua_enabled(&self) -> ControlResult<bool> {
        let value = self.call("iscsi.global.alua_enabled", json!([])).await?;
        value.as_bool().ok_or_else(|| ControlError::Protocol {
            method: "iscsi.global.alua_enabled".to_string(),
            reason: format!("expected bool, got {}", value),
        })
    }

    async fn raise_alert(&self, alert: Alert) -> ControlResult<()> {
        let params = serde_json::to_value(&alert).map_err(|e| ControlError::Protocol {
            method: "alert.oneshot_create".to_string(),
            reason: e.to_string(),
        })?;
        self.call_unit("alert.oneshot_create", json!([params])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_alert_wire_format() {
        let alert = Alert::UnauthorizedReboot {
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["kind"], "unauthorized_reboot");
        assert_eq!(value["at"], "2023-11-14T22:13:20Z");

        let alert = Alert::PoolImportFailed {
            pools: vec!["tank".to_string()],
        };
        assert_eq!(serde_json::to_value(&alert).unwrap()["pools"][0], "tank");
    }

    #[test]
    fn test_call_url() {
        let client = MiddlewareClient::new("http://127.0.0.1:6000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url, "http://127.0.0.1:6000/api/call");
    }

    #[tokio::test]
    async fn test_unreachable() {
        let client = MiddlewareClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            client.initialize_alerts().await,
            Err(ControlError::Unreachable(_))
        ));
    }
}
