use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use ahash::HashMap;
use sdn_egressip::NodeLiveness;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::metrics::EgressMetrics;
use crate::ovs::{FlowDumper, ParsedFlow, VXLAN_INBOUND_TABLE, VXLAN_OUTBOUND_TABLE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between full polls. Zero disables the poll loop.
    pub poll_interval: Duration,
    /// Time between re-checks of nodes that look unreachable.
    pub repoll_interval: Duration,
    /// Suspicious polls tolerated before a node is marked offline.
    pub max_retries: u32,
    pub ping_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            repoll_interval: Duration::from_secs(1),
            max_retries: 2,
            ping_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeLivenessUpdate {
    pub node_ip: String,
    pub offline: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct EgressVxlanNode {
    node_ip: String,
    offline: bool,
    packets_in: u64,
    packets_out: u64,
    retries: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CheckOutcome {
    retry: bool,
    updates: Vec<NodeLivenessUpdate>,
    pings: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    nodes: BTreeMap<String, EgressVxlanNode>,
    cancel: Option<CancellationToken>,
}

/// Per-node VXLAN packet counters, keyed by node IP.
#[derive(Debug, Default)]
struct VxlanCounters {
    inbound: HashMap<String, u64>,
    outbound: HashMap<String, u64>,
}

impl MonitorState {
    fn check(
        &mut self,
        counters: &VxlanCounters,
        retry_only: bool,
        max_retries: u32,
    ) -> CheckOutcome {
        let mut outcome = CheckOutcome::default();
        for node in self.nodes.values_mut() {
            if retry_only && node.retries == 0 {
                continue;
            }
            let packets_in = counters.inbound.get(&node.node_ip).copied().unwrap_or(0);
            let packets_out = counters.outbound.get(&node.node_ip).copied().unwrap_or(0);

            if node.offline {
                if packets_in > node.packets_in {
                    info!(node_ip = %node.node_ip, "egress node is back online");
                    node.offline = false;
                    outcome.updates.push(NodeLivenessUpdate {
                        node_ip: node.node_ip.clone(),
                        offline: false,
                    });
                } else if !retry_only {
                    outcome.pings.push(node.node_ip.clone());
                }
            } else if packets_out > node.packets_out && packets_in == node.packets_in {
                node.retries += 1;
                outcome.pings.push(node.node_ip.clone());
                if node.retries > max_retries {
                    warn!(
                        node_ip = %node.node_ip,
                        retries = node.retries,
                        "egress node is not answering VXLAN traffic, marking offline"
                    );
                    node.retries = 0;
                    node.offline = true;
                    outcome.updates.push(NodeLivenessUpdate {
                        node_ip: node.node_ip.clone(),
                        offline: true,
                    });
                } else {
                    // keep the old snapshot so the re-check compares against it
                    debug!(node_ip = %node.node_ip, retries = node.retries, "egress node may be offline");
                    outcome.retry = true;
                    continue;
                }
            } else {
                node.retries = 0;
            }

            node.packets_in = packets_in;
            node.packets_out = packets_out;
        }
        outcome
    }
}

/// Watches the VXLAN flow counters of nodes hosting egress IPs and reports
/// nodes that stop answering.
///
/// A single poll task runs while at least one node is monitored.
pub struct EgressVxlanMonitor {
    dumper: Arc<dyn FlowDumper>,
    updates: mpsc::Sender<NodeLivenessUpdate>,
    hook: OnceLock<Weak<dyn NodeLiveness>>,
    config: MonitorConfig,
    metrics: EgressMetrics,
    state: Mutex<MonitorState>,
}

impl EgressVxlanMonitor {
    pub fn new(
        dumper: Arc<dyn FlowDumper>,
        updates: mpsc::Sender<NodeLivenessUpdate>,
        config: MonitorConfig,
        metrics: EgressMetrics,
    ) -> Self {
        Self {
            dumper,
            updates,
            hook: OnceLock::new(),
            config,
            metrics,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Connects the tracker that is told about liveness changes and pings
    /// suspect nodes. Only the first hook is kept.
    pub fn set_hook(&self, hook: Weak<dyn NodeLiveness>) -> bool {
        self.hook.set(hook).is_ok()
    }

    fn hook(&self) -> Option<Arc<dyn NodeLiveness>> {
        self.hook.get().and_then(Weak::upgrade)
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(self: &Arc<Self>, node_ip: &str) {
        let mut state = self.lock();
        if state.nodes.contains_key(node_ip) {
            return;
        }
        debug!(%node_ip, "monitoring egress node");
        state.nodes.insert(
            node_ip.to_string(),
            EgressVxlanNode {
                node_ip: node_ip.to_string(),
                ..Default::default()
            },
        );
        self.metrics.monitored_nodes.set(state.nodes.len() as i64);

        if state.cancel.is_some() || self.config.poll_interval.is_zero() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let cancel = CancellationToken::new();
                handle.spawn(poll_loop(
                    Arc::downgrade(self),
                    self.config.poll_interval,
                    cancel.clone(),
                ));
                state.cancel = Some(cancel);
            }
            Err(e) => error!(%e, "no runtime to poll egress nodes on"),
        }
    }

    pub fn remove_node(&self, node_ip: &str) {
        let mut state = self.lock();
        if state.nodes.remove(node_ip).is_none() {
            return;
        }
        debug!(%node_ip, "no longer monitoring egress node");
        self.metrics.monitored_nodes.set(state.nodes.len() as i64);

        if state.nodes.is_empty()
            && let Some(cancel) = state.cancel.take()
        {
            cancel.cancel();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock().cancel.is_some()
    }

    pub fn is_offline(&self, node_ip: &str) -> Option<bool> {
        self.lock().nodes.get(node_ip).map(|node| node.offline)
    }

    /// One full poll, followed by quick re-checks of suspect nodes until
    /// they are either confirmed offline or cleared.
    pub async fn poll(&self) {
        let mut retry = self.check(false).await;
        while retry {
            sleep(self.config.repoll_interval).await;
            retry = self.check(true).await;
        }
    }

    async fn check(&self, retry_only: bool) -> bool {
        let counters = match self.dump_counters().await {
            Ok(counters) => counters,
            Err(e) => {
                error!(%e, "failed to dump VXLAN flow counters");
                self.metrics.flow_dump_failures.inc();
                return false;
            }
        };
        let outcome = self
            .lock()
            .check(&counters, retry_only, self.config.max_retries);

        let hook = self.hook();
        for update in outcome.updates {
            self.metrics.count_transition(update.offline);
            if let Some(hook) = &hook {
                hook.set_node_offline(&update.node_ip, update.offline);
            }
            if self.updates.send(update).await.is_err() {
                debug!("liveness update receiver is gone");
            }
        }
        if let Some(hook) = hook {
            for node_ip in outcome.pings {
                let hook = hook.clone();
                let timeout = self.config.ping_timeout;
                tokio::spawn(async move {
                    if !hook.ping(&node_ip, timeout).await {
                        debug!(%node_ip, "egress node did not answer ping");
                    }
                });
            }
        }
        outcome.retry
    }

    async fn dump_counters(&self) -> Result<VxlanCounters> {
        let mut counters = VxlanCounters::default();

        for flow in self.dumper.dump_flows(Some(VXLAN_INBOUND_TABLE)).await? {
            let flow = match ParsedFlow::parse(&flow) {
                Ok(flow) => flow,
                Err(e) => {
                    debug!(%e, "skipping flow");
                    continue;
                }
            };
            if let Some(node_ip) = flow.find_field("tun_src").and_then(|f| f.value.clone())
                && let Some(packets) = flow.n_packets()
            {
                counters.inbound.insert(node_ip, packets);
            }
        }

        for flow in self.dumper.dump_flows(Some(VXLAN_OUTBOUND_TABLE)).await? {
            let flow = match ParsedFlow::parse(&flow) {
                Ok(flow) => flow,
                Err(e) => {
                    debug!(%e, "skipping flow");
                    continue;
                }
            };
            let Some(packets) = flow.n_packets() else {
                continue;
            };
            // several flows may tunnel to the same node
            for action in flow.actions().iter().filter(|a| a.name == "set_field") {
                if let Some(node_ip) = action
                    .value
                    .as_deref()
                    .and_then(|v| v.strip_suffix("->tun_dst"))
                {
                    *counters.outbound.entry(node_ip.to_string()).or_default() += packets;
                }
            }
        }

        Ok(counters)
    }
}

async fn poll_loop(
    monitor: Weak<EgressVxlanMonitor>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = interval_at(Instant::now() + poll_interval, poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        monitor.poll().await;
    }
    debug!("egress VXLAN monitor stopped");
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use prometheus_client::registry::Registry;

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct FakeDumper {
        inbound: Mutex<BTreeMap<String, u64>>,
        outbound: Mutex<BTreeMap<String, u64>>,
        fail: Mutex<bool>,
    }

    impl FakeDumper {
        fn set(&self, node_ip: &str, packets_in: u64, packets_out: u64) {
            self.inbound
                .lock()
                .unwrap()
                .insert(node_ip.to_string(), packets_in);
            self.outbound
                .lock()
                .unwrap()
                .insert(node_ip.to_string(), packets_out);
        }
    }

    #[async_trait]
    impl FlowDumper for FakeDumper {
        async fn dump_flows(&self, table: Option<u8>) -> Result<Vec<String>> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Command {
                    command: "ovs-ofctl".into(),
                    stderr: "br0 is not a bridge".into(),
                });
            }
            let mut flows = Vec::new();
            match table {
                Some(VXLAN_INBOUND_TABLE) => {
                    for (ip, n) in self.inbound.lock().unwrap().iter() {
                        flows.push(format!(
                            "cookie=0x0, table=10, n_packets={n}, n_bytes=0, priority=100,tun_src={ip} actions=goto_table:30"
                        ));
                    }
                }
                Some(VXLAN_OUTBOUND_TABLE) => {
                    // split each count over two flows to the same node
                    for (ip, n) in self.outbound.lock().unwrap().iter() {
                        for (dst, packets) in [("10.128.0.0/23", n / 2), ("10.129.0.0/23", n - n / 2)] {
                            flows.push(format!(
                                "cookie=0x0, table=100, n_packets={packets}, n_bytes=0, priority=100,ip,nw_dst={dst} actions=move:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{ip}->tun_dst,output:1"
                            ));
                        }
                    }
                }
                _ => {}
            }
            Ok(flows)
        }
    }

    #[derive(Default)]
    struct RecordingLiveness {
        offline: Mutex<Vec<(String, bool)>>,
        pings: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeLiveness for RecordingLiveness {
        fn set_node_offline(&self, node_ip: &str, offline: bool) {
            self.offline
                .lock()
                .unwrap()
                .push((node_ip.to_string(), offline));
        }

        async fn ping(&self, ip: &str, _timeout: Duration) -> bool {
            self.pings.lock().unwrap().push(ip.to_string());
            true
        }
    }

    fn monitor(
        config: MonitorConfig,
    ) -> (
        Arc<EgressVxlanMonitor>,
        Arc<FakeDumper>,
        mpsc::Receiver<NodeLivenessUpdate>,
    ) {
        let dumper = Arc::new(FakeDumper::default());
        let (tx, rx) = mpsc::channel(16);
        let metrics = EgressMetrics::new(&mut Registry::default());
        let monitor = Arc::new(EgressVxlanMonitor::new(dumper.clone(), tx, config, metrics));
        (monitor, dumper, rx)
    }

    fn manual() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn counters(node_ip: &str, packets_in: u64, packets_out: u64) -> VxlanCounters {
        let mut counters = VxlanCounters::default();
        counters.inbound.insert(node_ip.to_string(), packets_in);
        counters.outbound.insert(node_ip.to_string(), packets_out);
        counters
    }

    fn state_with(node_ip: &str) -> MonitorState {
        let mut state = MonitorState::default();
        state.nodes.insert(
            node_ip.to_string(),
            EgressVxlanNode {
                node_ip: node_ip.to_string(),
                ..Default::default()
            },
        );
        state
    }

    #[test]
    fn test_suspect_node_keeps_snapshot() {
        let mut state = state_with("172.17.0.3");

        let outcome = state.check(&counters("172.17.0.3", 0, 10), false, 2);
        assert!(outcome.retry);
        assert!(outcome.updates.is_empty());
        assert_eq!(outcome.pings, ["172.17.0.3"]);

        let node = &state.nodes["172.17.0.3"];
        assert_eq!(node.retries, 1);
        assert_eq!(node.packets_out, 0);
    }

    #[test]
    fn test_answering_node_resets_retries() {
        let mut state = state_with("172.17.0.3");
        state.check(&counters("172.17.0.3", 0, 10), false, 2);

        let outcome = state.check(&counters("172.17.0.3", 4, 12), true, 2);
        assert_eq!(outcome, CheckOutcome::default());
        let node = &state.nodes["172.17.0.3"];
        assert_eq!(node.retries, 0);
        assert_eq!((node.packets_in, node.packets_out), (4, 12));
    }

    #[test]
    fn test_retry_only_skips_healthy_nodes() {
        let mut state = state_with("172.17.0.3");
        let outcome = state.check(&counters("172.17.0.3", 0, 10), true, 2);
        assert_eq!(outcome, CheckOutcome::default());
        assert_eq!(state.nodes["172.17.0.3"].packets_out, 0);
    }

    #[test]
    fn test_offline_after_max_retries() {
        let mut state = state_with("172.17.0.3");
        let suspect = counters("172.17.0.3", 0, 10);

        assert!(state.check(&suspect, false, 2).retry);
        assert!(state.check(&suspect, true, 2).retry);
        let outcome = state.check(&suspect, true, 2);
        assert!(!outcome.retry);
        assert_eq!(
            outcome.updates,
            [NodeLivenessUpdate {
                node_ip: "172.17.0.3".into(),
                offline: true,
            }]
        );

        // offline nodes are only pinged on full polls
        assert!(state.check(&suspect, true, 2).pings.is_empty());
        assert_eq!(state.check(&suspect, false, 2).pings, ["172.17.0.3"]);

        let outcome = state.check(&counters("172.17.0.3", 1, 10), false, 2);
        assert_eq!(
            outcome.updates,
            [NodeLivenessUpdate {
                node_ip: "172.17.0.3".into(),
                offline: false,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_scenario() {
        let (monitor, dumper, mut rx) = monitor(manual());
        let hook = Arc::new(RecordingLiveness::default());
        let weak: Weak<dyn NodeLiveness> = Arc::downgrade(&hook) as Weak<dyn NodeLiveness>;
        assert!(monitor.set_hook(weak));

        monitor.add_node("172.17.0.3");
        monitor.add_node("172.17.0.4");
        assert!(!monitor.is_polling());

        dumper.set("172.17.0.3", 0, 0);
        dumper.set("172.17.0.4", 20, 20);
        monitor.poll().await;
        assert!(rx.try_recv().is_err());

        // .3 keeps sending but never hears back
        dumper.set("172.17.0.3", 0, 10);
        dumper.set("172.17.0.4", 25, 30);
        monitor.poll().await;
        assert_eq!(
            rx.recv().await,
            Some(NodeLivenessUpdate {
                node_ip: "172.17.0.3".into(),
                offline: true,
            })
        );
        assert_eq!(monitor.is_offline("172.17.0.3"), Some(true));
        assert_eq!(monitor.is_offline("172.17.0.4"), Some(false));

        dumper.set("172.17.0.3", 3, 10);
        monitor.poll().await;
        assert_eq!(
            rx.recv().await,
            Some(NodeLivenessUpdate {
                node_ip: "172.17.0.3".into(),
                offline: false,
            })
        );

        tokio::task::yield_now().await;
        assert_eq!(
            *hook.offline.lock().unwrap(),
            [
                ("172.17.0.3".to_string(), true),
                ("172.17.0.3".to_string(), false)
            ]
        );
        let pings = hook.pings.lock().unwrap();
        assert!(!pings.is_empty());
        assert!(pings.iter().all(|ip| ip == "172.17.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_runs_while_nodes_are_monitored() {
        let (monitor, dumper, mut rx) = monitor(MonitorConfig::default());
        let start = Instant::now();

        monitor.add_node("172.17.0.3");
        assert!(monitor.is_polling());
        dumper.set("172.17.0.3", 0, 10);

        let update = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .unwrap();
        // one full poll after 5s, then two re-checks 1s apart
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8),
            "offline after {elapsed:?}"
        );
        assert_eq!(
            update,
            Some(NodeLivenessUpdate {
                node_ip: "172.17.0.3".into(),
                offline: true,
            })
        );

        monitor.add_node("172.17.0.3");
        monitor.remove_node("172.17.0.3");
        assert!(!monitor.is_polling());
        assert_eq!(monitor.metrics.monitored_nodes.get(), 0);

        monitor.add_node("172.17.0.4");
        assert!(monitor.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_failure_is_not_fatal() {
        let (monitor, dumper, mut rx) = monitor(manual());
        monitor.add_node("172.17.0.3");
        *dumper.fail.lock().unwrap() = true;
        dumper.set("172.17.0.3", 0, 10);

        monitor.poll().await;
        assert_eq!(monitor.metrics.flow_dump_failures.get(), 1);
        assert!(rx.try_recv().is_err());

        *dumper.fail.lock().unwrap() = false;
        monitor.poll().await;
        assert_eq!(rx.recv().await.map(|u| u.offline), Some(true));
    }

    #[tokio::test]
    async fn test_outbound_counters_are_summed() {
        let (monitor, dumper, _rx) = monitor(manual());
        dumper.set("172.17.0.3", 4, 11);

        let counters = monitor.dump_counters().await.unwrap();
        assert_eq!(counters.inbound.get("172.17.0.3"), Some(&4));
        assert_eq!(counters.outbound.get("172.17.0.3"), Some(&11));
    }
}
