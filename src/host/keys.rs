//! Key-protected provider side-channel

use super::exec::execute_async;
use super::HostResult;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Attach/detach of passphrase-protected providers backing encrypted pools
#[async_trait]
pub trait KeyProviders: Send + Sync {
    async fn attach_all(&self) -> HostResult<()>;

    async fn detach_all(&self) -> HostResult<()>;

    /// Pull fresh keys from the peer for the next promotion
    async fn sync_from_peer(&self) -> HostResult<()>;
}

/// `enc_helper` backed providers
pub struct EncHelper {
    bin: PathBuf,
}

impl EncHelper {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn call(&self, verb: &str) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.env("LD_LIBRARY_PATH", "/usr/local/lib").arg(verb);
        execute_async(&mut cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyProviders for EncHelper {
    async fn attach_all(&self) -> HostResult<()> {
        self.call("attachall").await
    }

    async fn detach_all(&self) -> HostResult<()> {
        self.call("detachall").await
    }

    async fn sync_from_peer(&self) -> HostResult<()> {
        self.call("syncfrompeer").await
    }
}
