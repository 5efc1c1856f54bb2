use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::monitor::MonitorConfig;

#[derive(Parser, Debug, Clone)]
pub struct EgressArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Routable IP of the node the agent is running on
    #[arg(long, env = "NODE_IP")]
    pub node_ip: String,

    /// Seconds between VXLAN counter polls, 0 disables the liveness monitor
    #[arg(long, default_value_t = 5)]
    pub egress_poll_interval: u64,

    /// Milliseconds between re-checks of a node that looks unreachable
    #[arg(long, default_value_t = 1000)]
    pub egress_repoll_interval_ms: u64,

    /// Suspicious polls tolerated before a node is marked offline
    #[arg(long, default_value_t = 2)]
    pub egress_max_retries: u32,

    /// Milliseconds to wait for a node to answer a ping
    #[arg(long, default_value_t = 1000)]
    pub egress_ping_timeout_ms: u64,

    /// Integration bridge carrying the VXLAN flows
    #[arg(long, env = "OVS_BRIDGE", default_value = "br0")]
    pub ovs_bridge: String,

    /// Path to ovs-ofctl
    #[arg(long, env = "OVS_OFCTL", default_value = "ovs-ofctl")]
    pub ovs_ofctl: PathBuf,

    /// Metrics listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

impl EgressArgs {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.egress_poll_interval),
            repoll_interval: Duration::from_millis(self.egress_repoll_interval_ms),
            max_retries: self.egress_max_retries,
            ping_timeout: Duration::from_millis(self.egress_ping_timeout_ms),
        }
    }
}
