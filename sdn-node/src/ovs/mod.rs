mod flow;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

pub use flow::{FlowAction, FlowField, ParsedFlow};

use crate::{Error, Result};

/// Table matching VXLAN traffic arriving from other nodes, one flow per node.
pub const VXLAN_INBOUND_TABLE: u8 = 10;
/// Table sending traffic into the VXLAN tunnel towards other nodes.
pub const VXLAN_OUTBOUND_TABLE: u8 = 100;

/// Source of the raw flow entries the liveness monitor reads counters from.
#[async_trait]
pub trait FlowDumper: Send + Sync {
    async fn dump_flows(&self, table: Option<u8>) -> Result<Vec<String>>;
}

/// Dumps flows from the integration bridge with `ovs-ofctl`.
#[derive(Clone, Debug)]
pub struct OvsOfctl {
    binary: PathBuf,
    bridge: String,
}

impl OvsOfctl {
    pub fn new(binary: impl Into<PathBuf>, bridge: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            bridge: bridge.into(),
        }
    }

    fn dump_flows_args(&self, table: Option<u8>) -> Vec<String> {
        let mut args = vec![
            "-O".to_string(),
            "OpenFlow13".to_string(),
            "dump-flows".to_string(),
            self.bridge.clone(),
        ];
        if let Some(table) = table {
            args.push(format!("table={table}"));
        }
        args
    }
}

#[async_trait]
impl FlowDumper for OvsOfctl {
    async fn dump_flows(&self, table: Option<u8>) -> Result<Vec<String>> {
        let args = self.dump_flows_args(table);
        let output = Command::new(&self.binary).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // skip the reply header, keep only flow entries
        Ok(String::from_utf8(output.stdout)?
            .lines()
            .filter(|line| line.contains("actions="))
            .map(|line| line.trim().to_string())
            .collect())
    }
}
