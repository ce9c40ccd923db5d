//! Interface introspection
//!
//! Point-in-time view of NIC and CARP state plus the one mutation the engine
//! performs on it: rewriting `advskew`. Callers must re-poll after any sleep;
//! nothing here is cached.

use crate::host::exec::{execute_async, stdout_string, ExecutionError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

/// advskew values written by the engine. Lower wins the election.
pub mod advskew {
    /// Win unconditionally while failover is administratively disabled
    pub const FORCED: u32 = 0;
    /// Normal master
    pub const MASTER: u32 = 1;
    /// Polite backup
    pub const BACKUP: u32 = 100;
    /// Explicit self-demotion after a promote-then-demote race
    pub const DEMOTED: u32 = 206;
}

/// Introspection errors
#[derive(Error, Debug)]
pub enum IntrospectError {
    #[error("ifconfig failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    #[error("Failed to parse interface state: {0}")]
    Parse(String),
}

pub type IntrospectResult<T> = Result<T, IntrospectError>;

/// CARP state of one VHID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CarpState {
    Master,
    Backup,
    Init,
}

impl FromStr for CarpState {
    type Err = IntrospectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MASTER" => Ok(CarpState::Master),
            "BACKUP" => Ok(CarpState::Backup),
            "INIT" => Ok(CarpState::Init),
            other => Err(IntrospectError::Parse(format!(
                "Unrecognized CARP state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CarpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CarpState::Master => "MASTER",
            CarpState::Backup => "BACKUP",
            CarpState::Init => "INIT",
        };
        f.write_str(s)
    }
}

/// Physical link status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Inactive,
}

/// One `carp:` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarpVhid {
    pub vhid: u32,
    pub state: CarpState,
    pub advskew: u32,
}

/// State of a single interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub link: LinkStatus,
    pub carp: Vec<CarpVhid>,
}

impl InterfaceSnapshot {
    pub fn vhid(&self, vhid: u32) -> Option<&CarpVhid> {
        self.carp.iter().find(|c| c.vhid == vhid)
    }

    pub fn count_in(&self, state: CarpState) -> usize {
        self.carp.iter().filter(|c| c.state == state).count()
    }

    pub fn has_state(&self, state: CarpState) -> bool {
        self.count_in(state) > 0
    }
}

/// NIC introspection and advskew control
#[async_trait]
pub trait InterfaceIntrospector: Send + Sync {
    async fn list_interfaces(&self) -> IntrospectResult<Vec<String>>;

    async fn snapshot(&self, ifname: &str) -> IntrospectResult<InterfaceSnapshot>;

    async fn set_advskew(&self, ifname: &str, vhid: u32, skew: u32) -> IntrospectResult<()>;

    async fn carp_state(&self, ifname: &str, vhid: u32) -> IntrospectResult<Option<CarpState>> {
        Ok(self.snapshot(ifname).await?.vhid(vhid).map(|c| c.state))
    }

    async fn vhids(&self, ifname: &str) -> IntrospectResult<Vec<u32>> {
        Ok(self
            .snapshot(ifname)
            .await?
            .carp
            .iter()
            .map(|c| c.vhid)
            .collect())
    }

    async fn link_status(&self, ifname: &str) -> IntrospectResult<LinkStatus> {
        Ok(self.snapshot(ifname).await?.link)
    }
}

/// Set `skew` on every VHID of each listed interface. Failures are logged and
/// skipped so one bad NIC cannot block the rest.
pub async fn set_advskew_all<'a, I>(introspector: &dyn InterfaceIntrospector, interfaces: I, skew: u32)
where
    I: IntoIterator<Item = &'a str>,
{
    for ifname in interfaces {
        let vhids = match introspector.vhids(ifname).await {
            Ok(vhids) => vhids,
            Err(e) => {
                warn!("Failed to read VHIDs of {}: {}", ifname, e);
                continue;
            }
        };
        for vhid in vhids {
            warn!("Setting advskew to {} on interface {} vhid {}", skew, ifname, vhid);
            if let Err(e) = introspector.set_advskew(ifname, vhid, skew).await {
                warn!("Failed to set advskew on {} vhid {}: {}", ifname, vhid, e);
            }
        }
    }
}

fn carp_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*carp:\s+(\S+)\s+vhid\s+(\d+)\s+advbase\s+\d+\s+advskew\s+(\d+)")
            .expect("static regex")
    })
}

fn status_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*status:\s+(.+?)\s*$").expect("static regex"))
}

/// Parse the output of `ifconfig <ifname>`
pub fn parse_ifconfig(name: &str, output: &str) -> IntrospectResult<InterfaceSnapshot> {
    let mut link = LinkStatus::Inactive;
    let mut carp = Vec::new();

    for line in output.lines() {
        if let Some(caps) = carp_line().captures(line) {
            let state = caps[1].parse::<CarpState>()?;
            let vhid = caps[2]
                .parse::<u32>()
                .map_err(|e| IntrospectError::Parse(format!("vhid: {}", e)))?;
            let advskew = caps[3]
                .parse::<u32>()
                .map_err(|e| IntrospectError::Parse(format!("advskew: {}", e)))?;
            carp.push(CarpVhid { vhid, state, advskew });
        } else if let Some(caps) = status_line().captures(line) {
            link = if &caps[1] == "active" {
                LinkStatus::Active
            } else {
                LinkStatus::Inactive
            };
        }
    }

    Ok(InterfaceSnapshot {
        name: name.to_string(),
        link,
        carp,
    })
}

/// `ifconfig(8)` backed introspector
pub struct Ifconfig {
    bin: PathBuf,
}

impl Ifconfig {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl InterfaceIntrospector for Ifconfig {
    async fn list_interfaces(&self) -> IntrospectResult<Vec<String>> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-l");
        let output = execute_async(&mut cmd).await?;
        Ok(stdout_string(&output)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    async fn snapshot(&self, ifname: &str) -> IntrospectResult<InterfaceSnapshot> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(ifname);
        let output = execute_async(&mut cmd).await.map_err(|e| match e.exit_code() {
            Some(1) => IntrospectError::UnknownInterface(ifname.to_string()),
            _ => IntrospectError::Execution(e),
        })?;
        parse_ifconfig(ifname, &stdout_string(&output))
    }

    async fn set_advskew(&self, ifname: &str, vhid: u32, skew: u32) -> IntrospectResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(ifname)
            .arg("vhid")
            .arg(vhid.to_string())
            .arg("advskew")
            .arg(skew.to_string());
        execute_async(&mut cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EM0: &str = "\
em0: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500
\toptions=98<VLAN_MTU,VLAN_HWTAGGING,VLAN_HWCSUM>
\tether 00:0c:29:aa:bb:cc
\tinet 10.0.0.2 netmask 0xffffff00 broadcast 10.0.0.255
\tinet 10.0.0.10 netmask 0xffffff00 broadcast 10.0.0.255 vhid 10
\tinet 10.0.1.10 netmask 0xffffff00 broadcast 10.0.1.255 vhid 11
\tcarp: MASTER vhid 10 advbase 1 advskew 1
\tcarp: BACKUP vhid 11 advbase 1 advskew 100
\tmedia: Ethernet autoselect (1000baseT <full-duplex>)
\tstatus: active
";

    #[test]
    fn test_parse_ifconfig() {
        let snap = parse_ifconfig("em0", EM0).unwrap();
        assert_eq!(snap.link, LinkStatus::Active);
        assert_eq!(snap.carp.len(), 2);
        assert_eq!(
            snap.vhid(10),
            Some(&CarpVhid { vhid: 10, state: CarpState::Master, advskew: 1 })
        );
        assert_eq!(snap.vhid(11).map(|c| c.advskew), Some(100));
        assert_eq!(snap.count_in(CarpState::Master), 1);
        assert!(snap.has_state(CarpState::Backup));
        assert!(!snap.has_state(CarpState::Init));
    }

    #[test]
    fn test_parse_no_carrier() {
        let out = "ix0: flags=8802<BROADCAST,SIMPLEX,MULTICAST> metric 0 mtu 1500\n\tstatus: no carrier\n";
        let snap = parse_ifconfig("ix0", out).unwrap();
        assert_eq!(snap.link, LinkStatus::Inactive);
        assert!(snap.carp.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_state() {
        let out = "\tcarp: WEIRD vhid 10 advbase 1 advskew 1\n";
        assert!(parse_ifconfig("em0", out).is_err());
    }

    #[test]
    fn test_carp_state_roundtrip_names() {
        for s in ["MASTER", "BACKUP", "INIT"] {
            assert_eq!(s.parse::<CarpState>().unwrap().to_string(), s);
        }
    }
}
