use std::sync::{Arc, Mutex, PoisonError, Weak};

use ahash::HashMap;
use sdn_egressip::{EgressIpTracker, EgressIpWatcher, NodeLiveness};
use tokio::sync::mpsc;
use tracing::debug;

use crate::checker::EgressCidrChecker;
use crate::config::EgressArgs;
use crate::metrics::EgressMetrics;
use crate::monitor::{EgressVxlanMonitor, MonitorConfig, NodeLivenessUpdate};
use crate::ovs::{FlowDumper, OvsOfctl};

const LIVENESS_UPDATE_CAPACITY: usize = 64;

/// Wraps the dataplane watcher of a node.
///
/// Every remote node that hosts at least one claimed egress IP is watched by
/// the VXLAN monitor. The local node is never watched.
pub struct NodeEgressWatcher<W> {
    inner: W,
    local_ip: String,
    monitor: Arc<EgressVxlanMonitor>,
    metrics: EgressMetrics,
    claims: Mutex<HashMap<String, usize>>,
}

impl<W: EgressIpWatcher> NodeEgressWatcher<W> {
    pub fn new(
        inner: W,
        local_ip: &str,
        monitor: Arc<EgressVxlanMonitor>,
        metrics: EgressMetrics,
    ) -> Self {
        Self {
            inner,
            local_ip: local_ip.to_string(),
            monitor,
            metrics,
            claims: Mutex::new(HashMap::default()),
        }
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    fn watch_node(&self, node_ip: &str) {
        if node_ip == self.local_ip {
            return;
        }
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let count = claims.entry(node_ip.to_string()).or_default();
        *count += 1;
        if *count == 1 {
            self.monitor.add_node(node_ip);
        }
    }

    fn unwatch_node(&self, node_ip: &str) {
        if node_ip == self.local_ip {
            return;
        }
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = claims.get_mut(node_ip) else {
            debug!(%node_ip, "release for a node without claims");
            return;
        };
        *count -= 1;
        if *count == 0 {
            claims.remove(node_ip);
            self.monitor.remove_node(node_ip);
        }
    }
}

impl<W: EgressIpWatcher> EgressIpWatcher for NodeEgressWatcher<W> {
    fn claim_egress_ip(&self, vnid: u32, egress_ip: &str, node_ip: &str) {
        self.metrics.count_callback("claim");
        self.watch_node(node_ip);
        self.inner.claim_egress_ip(vnid, egress_ip, node_ip);
    }

    fn release_egress_ip(&self, egress_ip: &str, node_ip: &str) {
        self.metrics.count_callback("release");
        self.unwatch_node(node_ip);
        self.inner.release_egress_ip(egress_ip, node_ip);
    }

    fn set_namespace_egress_normal(&self, vnid: u32) {
        self.metrics.count_callback("normal");
        self.inner.set_namespace_egress_normal(vnid);
    }

    fn set_namespace_egress_dropped(&self, vnid: u32) {
        self.metrics.count_callback("dropped");
        self.inner.set_namespace_egress_dropped(vnid);
    }

    fn set_namespace_egress_via_egress_ip(&self, vnid: u32, egress_ip: &str, node_ip: &str) {
        self.metrics.count_callback("via");
        self.inner
            .set_namespace_egress_via_egress_ip(vnid, egress_ip, node_ip);
    }

    fn update_egress_cidrs(&self) {
        self.metrics.count_callback("update_egress_cidrs");
        self.inner.update_egress_cidrs();
    }
}

pub type NodeEgressTracker<W> = EgressIpTracker<NodeEgressWatcher<W>>;

/// Egress IP handling of a node: the tracker, and the monitor that takes
/// nodes that stop answering out of rotation.
pub struct EgressIpNode<W> {
    tracker: Arc<NodeEgressTracker<W>>,
    monitor: Arc<EgressVxlanMonitor>,
    config: MonitorConfig,
    metrics: EgressMetrics,
}

impl<W: EgressIpWatcher + 'static> EgressIpNode<W> {
    pub fn new(
        args: &EgressArgs,
        watcher: W,
        dumper: Arc<dyn FlowDumper>,
        metrics: EgressMetrics,
    ) -> (Self, mpsc::Receiver<NodeLivenessUpdate>) {
        let (tx, rx) = mpsc::channel(LIVENESS_UPDATE_CAPACITY);
        let config = args.monitor_config();
        let monitor = Arc::new(EgressVxlanMonitor::new(
            dumper,
            tx,
            config.clone(),
            metrics.clone(),
        ));
        let tracker = Arc::new(EgressIpTracker::new(NodeEgressWatcher::new(
            watcher,
            &args.node_ip,
            monitor.clone(),
            metrics.clone(),
        )));
        let hook = Arc::downgrade(&tracker) as Weak<dyn NodeLiveness>;
        monitor.set_hook(hook);

        let node = Self {
            tracker,
            monitor,
            config,
            metrics,
        };
        (node, rx)
    }

    /// Reads flow counters with `ovs-ofctl` and reports to the global registry.
    pub fn with_ovs(args: &EgressArgs, watcher: W) -> (Self, mpsc::Receiver<NodeLivenessUpdate>) {
        let dumper = Arc::new(OvsOfctl::new(&args.ovs_ofctl, &args.ovs_bridge));
        Self::new(args, watcher, dumper, EgressMetrics::register())
    }

    pub fn tracker(&self) -> &Arc<NodeEgressTracker<W>> {
        &self.tracker
    }

    pub fn monitor(&self) -> &Arc<EgressVxlanMonitor> {
        &self.monitor
    }

    /// Pings the nodes with egress CIDRs through the tracker, on the same
    /// schedule as the VXLAN monitor. Needed wherever egress IPs are
    /// allocated automatically, since drained nodes are not VXLAN monitored.
    pub fn cidr_checker(&self) -> EgressCidrChecker {
        EgressCidrChecker::new(
            self.tracker.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
    }
}
