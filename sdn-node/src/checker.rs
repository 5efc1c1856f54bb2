use std::sync::Arc;

use ahash::HashMap;
use sdn_egressip::{EgressCidrNodes, NodeLiveness};
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::EgressMetrics;
use crate::monitor::MonitorConfig;

/// Pings every node with egress CIDRs, including nodes that currently host
/// nothing, so a node drained while offline gets egress IPs again once it
/// answers.
pub struct EgressCidrChecker {
    nodes: Arc<dyn EgressCidrNodes>,
    config: MonitorConfig,
    metrics: EgressMetrics,
    retries: HashMap<String, u32>,
}

impl EgressCidrChecker {
    pub fn new(nodes: Arc<dyn EgressCidrNodes>, config: MonitorConfig, metrics: EgressMetrics) -> Self {
        Self {
            nodes,
            config,
            metrics,
            retries: HashMap::default(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let poll_interval = self.config.poll_interval;
        if poll_interval.is_zero() {
            return;
        }
        let mut interval = interval_at(Instant::now() + poll_interval, poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.poll().await;
        }
        debug!("egress CIDR node checker stopped");
    }

    /// One full poll, then re-checks of nodes that missed a ping until they
    /// answer or are marked offline.
    pub async fn poll(&mut self) {
        let mut retry = self.check(false).await;
        while retry {
            sleep(self.config.repoll_interval).await;
            retry = self.check(true).await;
        }
    }

    async fn check(&mut self, retry_only: bool) -> bool {
        let nodes = self.nodes.egress_cidr_nodes();
        self.retries
            .retain(|node_ip, _| nodes.iter().any(|node| node.node_ip == *node_ip));

        let mut retry = false;
        for node in nodes {
            let retries = self.retries.get(&node.node_ip).copied().unwrap_or(0);
            if retry_only && retries == 0 {
                continue;
            }
            let online = self
                .nodes
                .ping(&node.node_ip, self.config.ping_timeout)
                .await;

            if online {
                self.retries.remove(&node.node_ip);
                if node.offline {
                    info!(node_ip = %node.node_ip, "egress CIDR node answers again");
                    self.metrics.count_transition(false);
                    self.nodes.set_node_offline(&node.node_ip, false);
                }
            } else if !node.offline {
                let retries = retries + 1;
                if retries > self.config.max_retries {
                    warn!(node_ip = %node.node_ip, retries, "egress CIDR node is not answering, marking offline");
                    self.retries.remove(&node.node_ip);
                    self.metrics.count_transition(true);
                    self.nodes.set_node_offline(&node.node_ip, true);
                } else {
                    debug!(node_ip = %node.node_ip, retries, "egress CIDR node missed a ping");
                    self.retries.insert(node.node_ip, retries);
                    retry = true;
                }
            }
        }
        retry
    }
}
