//! Dependent service orchestration
//!
//! Restarts run concurrently, each bounded by its own deadline. A timeout or
//! failure is logged and never cancels its siblings.

use crate::host::exec::{execute_async, run, stdout_string, ExecutionError};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Services that must be back before the node announces mastery
pub const CRITICAL_SERVICES: &[&str] = &["iscsitarget", "cifs", "nfs", "nvmet"];

/// Block target service. Runs on both nodes under ALUA.
pub const ISCSI_TARGET: &str = "iscsitarget";

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service command failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Service {name} did not finish {action} within {secs}s")]
    Timeout {
        name: String,
        action: &'static str,
        secs: u64,
    },

    #[error("Services registry unavailable: {0}")]
    Registry(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// rc-style service control
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Services enabled in the registry
    async fn enabled_services(&self) -> ServiceResult<Vec<String>>;

    async fn is_enabled(&self, name: &str) -> ServiceResult<bool> {
        Ok(self.enabled_services().await?.iter().any(|s| s == name))
    }

    async fn is_running(&self, name: &str) -> ServiceResult<bool>;

    async fn start(&self, name: &str) -> ServiceResult<()>;

    async fn stop(&self, name: &str) -> ServiceResult<()>;

    async fn restart(&self, name: &str) -> ServiceResult<()>;
}

/// Enabled services split by the critical set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRestartPlan {
    pub critical: Vec<String>,
    pub non_critical: Vec<String>,
}

impl ServiceRestartPlan {
    pub fn from_enabled(enabled: impl IntoIterator<Item = String>) -> Self {
        let (critical, non_critical) = enabled
            .into_iter()
            .partition(|s| CRITICAL_SERVICES.contains(&s.as_str()));
        Self {
            critical,
            non_critical,
        }
    }
}

/// Result of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartReport {
    pub restarted: Vec<String>,
    pub skipped: Vec<String>,
    pub timed_out: Vec<String>,
    pub failed: Vec<String>,
}

enum Step {
    Restarted,
    TimedOut,
    Failed,
}

/// Drives [`ServiceControl`] in the order promotion and demotion need
pub struct ServiceOrchestrator<'a> {
    control: &'a dyn ServiceControl,
}

impl<'a> ServiceOrchestrator<'a> {
    pub fn new(control: &'a dyn ServiceControl) -> Self {
        Self { control }
    }

    /// Restart either the critical or the non-critical part of the enabled
    /// services, all at once, each bounded by `timeout`.
    pub async fn restart_services(&self, critical: bool, timeout: Duration) -> RestartReport {
        self.restart_services_except(critical, timeout, &[]).await
    }

    /// [`Self::restart_services`] minus the services in `skip`, which the
    /// caller restarts on its own
    pub async fn restart_services_except(
        &self,
        critical: bool,
        timeout: Duration,
        skip: &[&str],
    ) -> RestartReport {
        let enabled = match self.control.enabled_services().await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!("Failed to query enabled services: {}", e);
                return RestartReport::default();
            }
        };
        let plan = ServiceRestartPlan::from_enabled(enabled);
        let batch = if critical { plan.critical } else { plan.non_critical };

        let mut report = RestartReport::default();
        let mut targets = Vec::with_capacity(batch.len());
        for name in batch {
            if skip.contains(&name.as_str()) {
                continue;
            }
            // iSCSI keeps running on the standby under ALUA; restarting it
            // would drop every initiator path.
            if critical && name == ISCSI_TARGET && self.control.is_running(&name).await.unwrap_or(false) {
                info!("Not restarting {}, already running", name);
                report.skipped.push(name);
                continue;
            }
            targets.push(name);
        }

        let results = join_all(targets.iter().map(|name| self.restart_one(name, timeout))).await;
        for (name, step) in targets.into_iter().zip(results) {
            match step {
                Step::Restarted => report.restarted.push(name),
                Step::TimedOut => report.timed_out.push(name),
                Step::Failed => report.failed.push(name),
            }
        }
        report
    }

    async fn restart_one(&self, name: &str, timeout: Duration) -> Step {
        info!("Restarting {}", name);
        match tokio::time::timeout(timeout, self.control.restart(name)).await {
            Ok(Ok(())) => Step::Restarted,
            Ok(Err(e)) => {
                error!("Failed to restart service {}: {}", name, e);
                Step::Failed
            }
            Err(_) => {
                error!(
                    "Failed to restart service \"{}\" after {} seconds",
                    name,
                    timeout.as_secs()
                );
                Step::TimedOut
            }
        }
    }

    /// Restart a single service, logging failures
    pub async fn restart(&self, name: &str, timeout: Duration) -> bool {
        matches!(self.restart_one(name, timeout).await, Step::Restarted)
    }

    /// Stop a single service, logging failures
    pub async fn stop(&self, name: &str, timeout: Duration) -> bool {
        info!("Stopping {}", name);
        match tokio::time::timeout(timeout, self.control.stop(name)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to stop service {}: {}", name, e);
                false
            }
            Err(_) => {
                warn!("Stopping {} timed out after {}s", name, timeout.as_secs());
                false
            }
        }
    }

    /// Restart `name` only if it is enabled in the registry
    pub async fn restart_if_enabled(&self, name: &str, timeout: Duration) -> bool {
        match self.control.is_enabled(name).await {
            Ok(true) => self.restart(name, timeout).await,
            Ok(false) => false,
            Err(e) => {
                warn!("Failed to query whether {} is enabled: {}", name, e);
                false
            }
        }
    }
}

/// `service(8)` backed control
pub struct RcService {
    bin: PathBuf,
}

impl RcService {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn action(&self, name: &str, action: &str) -> ServiceResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(name).arg(action);
        execute_async(&mut cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for RcService {
    async fn enabled_services(&self) -> ServiceResult<Vec<String>> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-e");
        let output = execute_async(&mut cmd)
            .await
            .map_err(|e| ServiceError::Registry(e.to_string()))?;
        // `service -e` prints rc script paths
        Ok(stdout_string(&output)
            .lines()
            .filter_map(|line| line.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn is_running(&self, name: &str) -> ServiceResult<bool> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(name).arg("onestatus");
        Ok(run(&mut cmd).await?.status.success())
    }

    async fn start(&self, name: &str) -> ServiceResult<()> {
        self.action(name, "start").await
    }

    async fn stop(&self, name: &str) -> ServiceResult<()> {
        self.action(name, "stop").await
    }

    async fn restart(&self, name: &str) -> ServiceResult<()> {
        self.action(name, "restart").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Registry {
        enabled: Vec<String>,
        running: Vec<String>,
        delays: HashMap<String, Duration>,
        restarted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceControl for Registry {
        async fn enabled_services(&self) -> ServiceResult<Vec<String>> {
            Ok(self.enabled.clone())
        }

        async fn is_running(&self, name: &str) -> ServiceResult<bool> {
            Ok(self.running.iter().any(|s| s == name))
        }

        async fn start(&self, _name: &str) -> ServiceResult<()> {
            Ok(())
        }

        async fn stop(&self, _name: &str) -> ServiceResult<()> {
            Ok(())
        }

        async fn restart(&self, name: &str) -> ServiceResult<()> {
            if let Some(delay) = self.delays.get(name) {
                tokio::time::sleep(*delay).await;
            }
            self.restarted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_partition() {
        let plan = ServiceRestartPlan::from_enabled(names(&["ssh", "nfs", "cifs", "snmp"]));
        assert_eq!(plan.critical, names(&["nfs", "cifs"]));
        assert_eq!(plan.non_critical, names(&["ssh", "snmp"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_batch_skips_running_iscsi() {
        let registry = Registry {
            enabled: names(&["iscsitarget", "nfs", "ssh"]),
            running: names(&["iscsitarget"]),
            ..Default::default()
        };
        let report = ServiceOrchestrator::new(&registry)
            .restart_services(true, Duration::from_secs(15))
            .await;
        assert_eq!(report.restarted, names(&["nfs"]));
        assert_eq!(report.skipped, names(&["iscsitarget"]));
        assert_eq!(*registry.restarted.lock().unwrap(), names(&["nfs"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_leaves_out_individually_restarted() {
        let registry = Registry {
            enabled: names(&["collectd", "ssh", "syslogd"]),
            ..Default::default()
        };
        let report = ServiceOrchestrator::new(&registry)
            .restart_services_except(false, Duration::from_secs(60), &["collectd", "syslogd"])
            .await;
        assert_eq!(report.restarted, names(&["ssh"]));
        assert_eq!(*registry.restarted.lock().unwrap(), names(&["ssh"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_abort_batch() {
        let mut delays = HashMap::new();
        delays.insert("snmp".to_string(), Duration::from_secs(120));
        let registry = Registry {
            enabled: names(&["snmp", "ssh", "ups"]),
            delays,
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        let report = ServiceOrchestrator::new(&registry)
            .restart_services(false, Duration::from_secs(60))
            .await;
        assert_eq!(report.timed_out, names(&["snmp"]));
        assert_eq!(report.restarted, names(&["ssh", "ups"]));
        // Restarts ran concurrently: total wall time is one deadline
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test]
    async fn test_restart_if_enabled() {
        let registry = Registry {
            enabled: names(&["ssh"]),
            ..Default::default()
        };
        let orchestrator = ServiceOrchestrator::new(&registry);
        assert!(orchestrator.restart_if_enabled("ssh", Duration::from_secs(5)).await);
        assert!(!orchestrator.restart_if_enabled("iscsitarget", Duration::from_secs(5)).await);
    }
}
