//! Kernel HA knobs

use super::exec::{execute_async, stdout_string};
use super::{HostError, HostResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// CTL HA role. The block target only serves from backing storage while
/// `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
    Active,
    Standby,
}

impl HaRole {
    fn sysctl_value(self) -> u8 {
        match self {
            HaRole::Active => 0,
            HaRole::Standby => 1,
        }
    }
}

#[async_trait]
pub trait Kernel: Send + Sync {
    async fn set_ha_role(&self, role: HaRole) -> HostResult<()>;

    /// `net.inet.carp.allow`. Zero means the operator disabled CARP.
    async fn carp_allowed(&self) -> HostResult<bool>;
}

/// `sysctl(8)` backed knobs
pub struct Sysctl {
    bin: PathBuf,
}

impl Sysctl {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

pub fn parse_flag(name: &str, value: &str) -> HostResult<bool> {
    match value.trim().parse::<i64>() {
        Ok(v) => Ok(v != 0),
        Err(_) => Err(HostError::Parse(format!("{} = {:?}", name, value))),
    }
}

#[async_trait]
impl Kernel for Sysctl {
    async fn set_ha_role(&self, role: HaRole) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(format!("kern.cam.ctl.ha_role={}", role.sysctl_value()));
        execute_async(&mut cmd).await?;
        Ok(())
    }

    async fn carp_allowed(&self) -> HostResult<bool> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-n").arg("net.inet.carp.allow");
        let output = execute_async(&mut cmd).await?;
        parse_flag("net.inet.carp.allow", &stdout_string(&output))
    }
}
