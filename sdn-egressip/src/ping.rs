use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{EgressIpTracker, EgressIpWatcher, NodeLiveness};

impl<W: EgressIpWatcher> EgressIpTracker<W> {
    /// Address to probe for `ip`: a known node is reached through its
    /// overlay address, since the VXLAN path is what is being checked.
    fn ping_target(&self, ip: &str) -> String {
        self.lock()
            .node_by_ip(ip)
            .map(|node| node.sdn_ip.clone())
            .unwrap_or_else(|| ip.to_string())
    }

    /// Checks whether `ip` is reachable with a TCP connection to the discard
    /// port. A refused connection still means the node answered, so only a
    /// timeout counts as unreachable.
    pub async fn ping(&self, ip: &str, timeout: Duration) -> bool {
        let target = self.ping_target(ip);
        let addr = match target.parse::<IpAddr>() {
            Ok(addr) => SocketAddr::new(addr, self.ping_port),
            Err(e) => {
                debug!(%e, %target, "not pinging invalid address");
                return true;
            }
        };

        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => false,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => false,
            Ok(_) => true,
        }
    }
}

#[async_trait]
impl<W: EgressIpWatcher> NodeLiveness for EgressIpTracker<W> {
    fn set_node_offline(&self, node_ip: &str, offline: bool) {
        EgressIpTracker::set_node_offline(self, node_ip, offline);
    }

    async fn ping(&self, ip: &str, timeout: Duration) -> bool {
        EgressIpTracker::ping(self, ip, timeout).await
    }
}
