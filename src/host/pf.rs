//! Packet filter gate

use super::exec::execute_async;
use super::HostResult;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Client traffic gate
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Load the blocking ruleset and enable the filter
    async fn block(&self) -> HostResult<()>;

    /// Disable the filter and admit traffic
    async fn allow(&self) -> HostResult<()>;
}

/// `pfctl(8)` gate
pub struct Pfctl {
    bin: PathBuf,
    rules: PathBuf,
}

impl Pfctl {
    pub fn new(bin: impl Into<PathBuf>, rules: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            rules: rules.into(),
        }
    }
}

#[async_trait]
impl PacketFilter for Pfctl {
    async fn block(&self) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-ef").arg(&self.rules);
        execute_async(&mut cmd).await?;
        Ok(())
    }

    async fn allow(&self) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-d");
        execute_async(&mut cmd).await?;
        Ok(())
    }
}
