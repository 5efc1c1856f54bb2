use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::HashMap;
use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::{EgressIpWatcher, Error, Result};

/// Port of the TCP discard service, probed by [`EgressIpTracker::ping`].
pub(crate) const DISCARD_PORT: u16 = 9;

/// Egress configuration of a single node, as carried by its host subnet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostSubnetEgress {
    pub node_name: String,
    pub host_ip: String,
    /// Pod subnet of the node in CIDR notation, if known.
    pub subnet: Option<String>,
    pub egress_ips: Vec<String>,
    pub egress_cidrs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NamespaceState {
    Normal,
    Dropped,
    Via { egress_ip: String, node_ip: String },
}

#[derive(Debug)]
pub(crate) struct NodeEgress {
    pub(crate) name: String,
    pub(crate) node_ip: String,
    pub(crate) sdn_ip: String,
    pub(crate) requested_ips: BTreeSet<String>,
    pub(crate) requested_cidrs: BTreeSet<String>,
    pub(crate) parsed_cidrs: Vec<Ipv4Network>,
    pub(crate) offline: bool,
}

impl NodeEgress {
    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        self.parsed_cidrs.iter().any(|cidr| cidr.contains(ip))
    }
}

#[derive(Debug)]
pub(crate) struct NamespaceEgress {
    pub(crate) requested_ips: Vec<String>,
    pub(crate) state: NamespaceState,
}

#[derive(Debug)]
pub(crate) struct EgressIpInfo {
    pub(crate) ip: String,
    pub(crate) parsed: Option<Ipv4Addr>,
    pub(crate) nodes: Vec<String>,
    pub(crate) namespaces: Vec<u32>,
    pub(crate) assigned_node_ip: Option<String>,
    pub(crate) assigned_vnid: Option<u32>,
}

impl EgressIpInfo {
    fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            parsed: ip.parse().ok(),
            nodes: Vec::new(),
            namespaces: Vec::new(),
            assigned_node_ip: None,
            assigned_vnid: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct TrackerState {
    pub(crate) nodes: BTreeMap<String, NodeEgress>,
    pub(crate) nodes_by_ip: HashMap<String, String>,
    pub(crate) namespaces: HashMap<u32, NamespaceEgress>,
    pub(crate) egress_ips: BTreeMap<String, EgressIpInfo>,

    changed_egress_ips: BTreeSet<String>,
    changed_namespaces: BTreeSet<u32>,
    update_egress_cidrs: bool,
}

/// Arbitrates egress IP claims from nodes and namespaces.
///
/// Every public operation is one critical section that ends with an
/// arbitration pass reporting its decisions to the watcher.
pub struct EgressIpTracker<W> {
    watcher: W,
    state: Mutex<TrackerState>,
    pub(crate) ping_port: u16,
}

impl<W: EgressIpWatcher> EgressIpTracker<W> {
    pub fn new(watcher: W) -> Self {
        Self {
            watcher,
            state: Mutex::new(TrackerState::default()),
            ping_port: DISCARD_PORT,
        }
    }

    /// Probe a port other than discard when pinging nodes.
    pub fn with_ping_port(mut self, port: u16) -> Self {
        self.ping_port = port;
        self
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the egress IPs hosted by the node with IP `node_ip`.
    pub fn update_node_egress<S: AsRef<str>>(&self, node_ip: &str, requested_ips: &[S]) {
        self.update_host_subnet_egress(&HostSubnetEgress {
            node_name: node_ip.to_string(),
            host_ip: node_ip.to_string(),
            subnet: None,
            egress_ips: requested_ips.iter().map(|ip| ip.as_ref().to_string()).collect(),
            egress_cidrs: Vec::new(),
        });
    }

    pub fn update_host_subnet_egress(&self, host_subnet: &HostSubnetEgress) {
        self.lock()
            .update_host_subnet_egress(host_subnet, &self.watcher);
    }

    pub fn delete_host_subnet_egress(&self, node_name: &str) {
        let host_ip = {
            let state = self.lock();
            match state.nodes.get(node_name) {
                Some(node) => node.node_ip.clone(),
                None => return,
            }
        };
        self.update_host_subnet_egress(&HostSubnetEgress {
            node_name: node_name.to_string(),
            host_ip,
            ..Default::default()
        });
    }

    /// Sets the egress IPs of namespace `vnid`, in order of preference.
    pub fn update_namespace_egress<S: AsRef<str>>(&self, vnid: u32, requested_ips: &[S]) {
        let requested_ips = requested_ips
            .iter()
            .map(|ip| ip.as_ref().to_string())
            .collect();
        self.lock()
            .update_namespace_egress(vnid, requested_ips, &self.watcher);
    }

    pub fn delete_namespace_egress(&self, vnid: u32) {
        self.lock()
            .update_namespace_egress(vnid, Vec::new(), &self.watcher);
    }

    pub fn set_node_offline(&self, node_ip: &str, offline: bool) {
        self.lock()
            .set_node_offline(node_ip, offline, &self.watcher);
    }
}

impl TrackerState {
    fn node_ip(&self, name: &str) -> Option<String> {
        self.nodes.get(name).map(|node| node.node_ip.clone())
    }

    fn node_ip_or_name(&self, name: &str) -> String {
        self.node_ip(name).unwrap_or_else(|| name.to_string())
    }

    pub(crate) fn node_by_ip(&self, node_ip: &str) -> Option<&NodeEgress> {
        self.nodes_by_ip
            .get(node_ip)
            .and_then(|name| self.nodes.get(name))
    }

    fn has_egress_cidrs(&self) -> bool {
        self.nodes
            .values()
            .any(|node| !node.requested_cidrs.is_empty())
    }

    fn egress_ip_changed(&mut self, ip: &str) {
        let Some(eg) = self.egress_ips.get(ip) else {
            return;
        };
        self.changed_namespaces.extend(eg.namespaces.iter().copied());
        self.changed_egress_ips.insert(ip.to_string());
    }

    /// A node claim on `ip` may settle a same-node conflict with another
    /// egress IP of the namespaces listing `ip`, so those are re-checked too.
    fn node_claim_changed(&mut self, ip: &str) {
        let siblings: Vec<String> = self
            .egress_ips
            .get(ip)
            .into_iter()
            .flat_map(|eg| eg.namespaces.iter())
            .filter_map(|vnid| self.namespaces.get(vnid))
            .flat_map(|ns| ns.requested_ips.iter())
            .filter(|other| *other != ip)
            .cloned()
            .collect();
        self.egress_ip_changed(ip);
        for other in &siblings {
            self.egress_ip_changed(other);
        }
    }

    fn add_node_egress_ip(&mut self, node_name: &str, ip: &str) {
        self.egress_ips
            .entry(ip.to_string())
            .or_insert_with(|| EgressIpInfo::new(ip))
            .nodes
            .push(node_name.to_string());
        self.node_claim_changed(ip);
    }

    fn delete_node_egress_ip(&mut self, node_name: &str, ip: &str) {
        let Some(eg) = self.egress_ips.get_mut(ip) else {
            return;
        };
        if let Some(pos) = eg.nodes.iter().position(|name| name == node_name) {
            eg.nodes.remove(pos);
        }
        self.node_claim_changed(ip);
    }

    fn add_namespace_egress_ip(&mut self, vnid: u32, ip: &str) {
        self.egress_ips
            .entry(ip.to_string())
            .or_insert_with(|| EgressIpInfo::new(ip))
            .namespaces
            .push(vnid);
        self.egress_ip_changed(ip);
    }

    fn delete_namespace_egress_ip(&mut self, vnid: u32, ip: &str) {
        // mark first so the departing namespace is re-evaluated too
        self.egress_ip_changed(ip);
        let Some(eg) = self.egress_ips.get_mut(ip) else {
            return;
        };
        if let Some(pos) = eg.namespaces.iter().position(|ns| *ns == vnid) {
            eg.namespaces.remove(pos);
        }
    }

    fn update_host_subnet_egress<W: EgressIpWatcher>(
        &mut self,
        host_subnet: &HostSubnetEgress,
        watcher: &W,
    ) {
        let name = host_subnet.node_name.as_str();
        let sdn_ip = match host_subnet.subnet.as_deref().filter(|s| !s.is_empty()) {
            Some(subnet) => match default_gateway(subnet) {
                Ok(gateway) => gateway.to_string(),
                Err(e) => {
                    warn!(%e, node = name, "invalid node subnet");
                    host_subnet.host_ip.clone()
                }
            },
            None => host_subnet.host_ip.clone(),
        };
        let requested_ips: BTreeSet<String> = host_subnet.egress_ips.iter().cloned().collect();
        let requested_cidrs: BTreeSet<String> =
            host_subnet.egress_cidrs.iter().cloned().collect();
        let empty = requested_ips.is_empty() && requested_cidrs.is_empty();

        if !self.nodes.contains_key(name) {
            if empty {
                return;
            }
            self.nodes.insert(
                name.to_string(),
                NodeEgress {
                    name: name.to_string(),
                    node_ip: host_subnet.host_ip.clone(),
                    sdn_ip: sdn_ip.clone(),
                    requested_ips: BTreeSet::new(),
                    requested_cidrs: BTreeSet::new(),
                    parsed_cidrs: Vec::new(),
                    offline: false,
                },
            );
            self.nodes_by_ip
                .insert(host_subnet.host_ip.clone(), name.to_string());
        }
        let Some(node) = self.nodes.get(name) else {
            return;
        };

        if node.node_ip != host_subnet.host_ip {
            // Withdraw every claim under the old address and settle before
            // re-registering them under the new one.
            let old_ip = node.node_ip.clone();
            let ips: Vec<String> = node.requested_ips.iter().cloned().collect();
            info!(node = name, %old_ip, new_ip = %host_subnet.host_ip, "node renumbered");
            for ip in &ips {
                self.delete_node_egress_ip(name, ip);
            }
            self.sync_egress_ips(watcher);

            if self.nodes_by_ip.get(&old_ip).is_some_and(|n| n == name) {
                self.nodes_by_ip.remove(&old_ip);
            }
            self.nodes_by_ip
                .insert(host_subnet.host_ip.clone(), name.to_string());
            if let Some(node) = self.nodes.get_mut(name) {
                node.node_ip = host_subnet.host_ip.clone();
            }
            for ip in &ips {
                self.add_node_egress_ip(name, ip);
            }
        }

        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        node.sdn_ip = sdn_ip;
        if node.requested_cidrs != requested_cidrs {
            node.parsed_cidrs = parse_cidrs(&requested_cidrs);
            node.requested_cidrs = requested_cidrs;
            self.update_egress_cidrs = true;
        }
        let old_ips = std::mem::replace(&mut node.requested_ips, requested_ips.clone());

        for ip in requested_ips.difference(&old_ips) {
            self.add_node_egress_ip(name, ip);
        }
        for ip in old_ips.difference(&requested_ips) {
            self.delete_node_egress_ip(name, ip);
        }

        if empty {
            self.nodes.remove(name);
            if self
                .nodes_by_ip
                .get(&host_subnet.host_ip)
                .is_some_and(|n| n == name)
            {
                self.nodes_by_ip.remove(&host_subnet.host_ip);
            }
        }

        self.sync_egress_ips(watcher);
    }

    fn update_namespace_egress<W: EgressIpWatcher>(
        &mut self,
        vnid: u32,
        requested_ips: Vec<String>,
        watcher: &W,
    ) {
        let old_ips = match self.namespaces.get_mut(&vnid) {
            Some(ns) => std::mem::replace(&mut ns.requested_ips, requested_ips.clone()),
            None if requested_ips.is_empty() => return,
            None => {
                self.namespaces.insert(
                    vnid,
                    NamespaceEgress {
                        requested_ips: requested_ips.clone(),
                        state: NamespaceState::Normal,
                    },
                );
                Vec::new()
            }
        };

        let old: BTreeSet<&str> = old_ips.iter().map(String::as_str).collect();
        let new: BTreeSet<&str> = requested_ips.iter().map(String::as_str).collect();
        for ip in new.difference(&old) {
            self.add_namespace_egress_ip(vnid, ip);
        }
        for ip in old.difference(&new) {
            self.delete_namespace_egress_ip(vnid, ip);
        }
        for ip in new.intersection(&old) {
            self.egress_ip_changed(ip);
        }
        self.changed_namespaces.insert(vnid);

        self.sync_egress_ips(watcher);
    }

    fn set_node_offline<W: EgressIpWatcher>(&mut self, node_ip: &str, offline: bool, watcher: &W) {
        let Some(name) = self.nodes_by_ip.get(node_ip).cloned() else {
            return;
        };
        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        node.offline = offline;
        let has_cidrs = !node.requested_cidrs.is_empty();
        let ips: Vec<String> = node.requested_ips.iter().cloned().collect();

        info!(node = %name, %node_ip, offline, "node egress state changed");
        for ip in &ips {
            self.egress_ip_changed(ip);
        }
        if has_cidrs {
            self.update_egress_cidrs = true;
        }
        self.sync_egress_ips(watcher);
    }

    fn egress_ip_active(&self, eg: &EgressIpInfo) -> Result<bool> {
        let (node, vnid) = match (eg.nodes.as_slice(), eg.namespaces.as_slice()) {
            ([], _) | (_, []) => return Ok(false),
            ([first, second, ..], _) => {
                return Err(Error::MultipleNodes {
                    egress_ip: eg.ip.clone(),
                    first: self.node_ip_or_name(first),
                    second: self.node_ip_or_name(second),
                });
            }
            (_, [first, second, ..]) => {
                return Err(Error::MultipleNamespaces {
                    egress_ip: eg.ip.clone(),
                    first: *first,
                    second: *second,
                });
            }
            ([node], [vnid]) => (node, *vnid),
        };

        if let Some(ns) = self.namespaces.get(&vnid) {
            for other in ns.requested_ips.iter().filter(|ip| **ip != eg.ip) {
                if let Some(other_eg) = self.egress_ips.get(other)
                    && other_eg.nodes.len() == 1
                    && other_eg.nodes[0] == *node
                {
                    return Err(Error::SameNodeEgressIps {
                        vnid,
                        first: eg.ip.clone(),
                        second: other.clone(),
                        node_ip: self.node_ip_or_name(node),
                    });
                }
            }
        }
        Ok(true)
    }

    fn sync_egress_node_state<W: EgressIpWatcher>(&mut self, ip: &str, active: bool, watcher: &W) {
        let target = if active {
            self.egress_ips.get(ip).and_then(|eg| {
                let node_ip = self.node_ip(eg.nodes.first()?)?;
                Some((node_ip, *eg.namespaces.first()?))
            })
        } else {
            None
        };
        let Some(eg) = self.egress_ips.get_mut(ip) else {
            return;
        };

        match target {
            Some((node_ip, vnid)) => {
                if eg.assigned_node_ip.as_deref() != Some(node_ip.as_str())
                    || eg.assigned_vnid != Some(vnid)
                {
                    if let Some(old_node_ip) = eg.assigned_node_ip.take() {
                        debug!(egress_ip = ip, node_ip = %old_node_ip, "releasing egress IP");
                        watcher.release_egress_ip(ip, &old_node_ip);
                    }
                    debug!(egress_ip = ip, %node_ip, vnid, "claiming egress IP");
                    watcher.claim_egress_ip(vnid, ip, &node_ip);
                    eg.assigned_node_ip = Some(node_ip);
                    eg.assigned_vnid = Some(vnid);
                }
            }
            None => {
                if let Some(old_node_ip) = eg.assigned_node_ip.take() {
                    eg.assigned_vnid = None;
                    debug!(egress_ip = ip, node_ip = %old_node_ip, "releasing egress IP");
                    watcher.release_egress_ip(ip, &old_node_ip);
                }
            }
        }

        if eg.assigned_node_ip.is_none() {
            self.update_egress_cidrs = true;
        }
    }

    fn sync_egress_namespace_state<W: EgressIpWatcher>(&mut self, vnid: u32, watcher: &W) {
        let Some(ns) = self.namespaces.get(&vnid) else {
            return;
        };
        if ns.requested_ips.is_empty() {
            if ns.state != NamespaceState::Normal {
                info!(vnid, "namespace egress normal");
                watcher.set_namespace_egress_normal(vnid);
            }
            self.namespaces.remove(&vnid);
            return;
        }

        let single = ns.requested_ips.len() == 1;
        let mut candidate = None;
        for ip in &ns.requested_ips {
            let Some(eg) = self.egress_ips.get(ip) else {
                continue;
            };
            if eg.namespaces.len() > 1 {
                candidate = None;
                break;
            }
            if candidate.is_some() {
                continue;
            }
            let Some(node_ip) = &eg.assigned_node_ip else {
                continue;
            };
            let offline = self.node_by_ip(node_ip).is_some_and(|node| node.offline);
            if single || !offline {
                candidate = Some(NamespaceState::Via {
                    egress_ip: ip.clone(),
                    node_ip: node_ip.clone(),
                });
            }
        }
        let next = candidate.unwrap_or(NamespaceState::Dropped);
        if ns.state == next {
            return;
        }

        match &next {
            NamespaceState::Via { egress_ip, node_ip } => {
                info!(vnid, %egress_ip, %node_ip, "namespace egress via egress IP");
                watcher.set_namespace_egress_via_egress_ip(vnid, egress_ip, node_ip);
            }
            _ => {
                info!(vnid, "namespace egress dropped");
                watcher.set_namespace_egress_dropped(vnid);
            }
        }
        if let Some(ns) = self.namespaces.get_mut(&vnid) {
            ns.state = next;
        }
    }

    fn sync_egress_ips<W: EgressIpWatcher>(&mut self, watcher: &W) {
        let changed_egress_ips = std::mem::take(&mut self.changed_egress_ips);
        let changed_namespaces = std::mem::take(&mut self.changed_namespaces);

        for ip in &changed_egress_ips {
            let active = match self.egress_ips.get(ip).map(|eg| self.egress_ip_active(eg)) {
                Some(Ok(active)) => active,
                Some(Err(e)) => {
                    warn!(%e, "egress IP conflict");
                    false
                }
                None => false,
            };
            self.sync_egress_node_state(ip, active, watcher);
        }

        for vnid in changed_namespaces {
            self.sync_egress_namespace_state(vnid, watcher);
        }

        if std::mem::take(&mut self.update_egress_cidrs) && self.has_egress_cidrs() {
            watcher.update_egress_cidrs();
        }
    }
}

/// First host address of `subnet`, the node's gateway on the overlay.
fn default_gateway(subnet: &str) -> Result<Ipv4Addr> {
    let network: Ipv4Network = subnet.parse()?;
    u32::from(network.network())
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or_else(|| Error::Gateway(subnet.to_string()))
}

fn parse_cidrs(cidrs: &BTreeSet<String>) -> Vec<Ipv4Network> {
    cidrs
        .iter()
        .filter_map(|cidr| match cidr.parse::<Ipv4Network>() {
            Ok(network) => Some(network),
            Err(e) => {
                warn!(%e, %cidr, "ignoring egress CIDR");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{RecordingWatcher, init_tracing};

    fn tracker() -> EgressIpTracker<RecordingWatcher> {
        init_tracing();
        EgressIpTracker::new(RecordingWatcher::default())
    }

    fn host_subnet(name: &str, host_ip: &str, ips: &[&str]) -> HostSubnetEgress {
        HostSubnetEgress {
            node_name: name.to_string(),
            host_ip: host_ip.to_string(),
            subnet: None,
            egress_ips: ips.iter().map(|ip| ip.to_string()).collect(),
            egress_cidrs: Vec::new(),
        }
    }

    #[test]
    fn test_egress_ip() {
        let t = tracker();
        let w = t.watcher();

        t.update_node_egress("172.17.0.3", &[] as &[&str]);
        t.update_node_egress("172.17.0.4", &[] as &[&str]);
        t.delete_namespace_egress(42);
        t.delete_namespace_egress(43);
        w.assert_no_changes();

        t.update_namespace_egress(42, &["172.17.0.100"]);
        w.assert_changes(&["namespace 42 dropped"]);

        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        t.update_node_egress("172.17.0.3", &["172.17.0.100", "172.17.0.101"]);
        w.assert_no_changes();
        t.update_node_egress("172.17.0.5", &["172.17.0.105"]);
        w.assert_no_changes();

        t.update_namespace_egress(43, &["172.17.0.105"]);
        w.assert_changes(&[
            "claim 172.17.0.105 on 172.17.0.5 for namespace 43",
            "namespace 43 via 172.17.0.105 on 172.17.0.5",
        ]);

        t.update_namespace_egress(43, &["172.17.0.101"]);
        w.assert_changes(&[
            "release 172.17.0.105 on 172.17.0.5",
            "claim 172.17.0.101 on 172.17.0.3 for namespace 43",
            "namespace 43 via 172.17.0.101 on 172.17.0.3",
        ]);

        t.update_namespace_egress(44, &["172.17.0.104"]);
        w.assert_changes(&["namespace 44 dropped"]);
        t.update_node_egress("172.17.0.4", &["172.17.0.102", "172.17.0.104"]);
        w.assert_changes(&[
            "claim 172.17.0.104 on 172.17.0.4 for namespace 44",
            "namespace 44 via 172.17.0.104 on 172.17.0.4",
        ]);

        t.update_namespace_egress(44, &["172.17.0.102"]);
        w.assert_changes(&[
            "release 172.17.0.104 on 172.17.0.4",
            "claim 172.17.0.102 on 172.17.0.4 for namespace 44",
            "namespace 44 via 172.17.0.102 on 172.17.0.4",
        ]);

        t.update_node_egress("172.17.0.4", &["172.17.0.102", "172.17.0.103"]);
        w.assert_no_changes();
        t.update_namespace_egress(45, &["172.17.0.103"]);
        w.assert_changes(&[
            "claim 172.17.0.103 on 172.17.0.4 for namespace 45",
            "namespace 45 via 172.17.0.103 on 172.17.0.4",
        ]);

        t.delete_namespace_egress(44);
        w.assert_changes(&["release 172.17.0.102 on 172.17.0.4", "namespace 44 normal"]);

        t.update_namespace_egress(44, &["172.17.0.102"]);
        w.assert_changes(&[
            "claim 172.17.0.102 on 172.17.0.4 for namespace 44",
            "namespace 44 via 172.17.0.102 on 172.17.0.4",
        ]);

        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_changes(&["release 172.17.0.101 on 172.17.0.3", "namespace 43 dropped"]);

        t.update_node_egress("172.17.0.4", &["172.17.0.102"]);
        w.assert_changes(&["release 172.17.0.103 on 172.17.0.4", "namespace 45 dropped"]);

        t.update_node_egress("172.17.0.3", &["172.17.0.100", "172.17.0.103"]);
        w.assert_changes(&[
            "claim 172.17.0.103 on 172.17.0.3 for namespace 45",
            "namespace 45 via 172.17.0.103 on 172.17.0.3",
        ]);

        t.update_node_egress("172.17.0.4", &["172.17.0.101", "172.17.0.102"]);
        w.assert_changes(&[
            "claim 172.17.0.101 on 172.17.0.4 for namespace 43",
            "namespace 43 via 172.17.0.101 on 172.17.0.4",
        ]);
    }

    #[test]
    fn test_updates_are_idempotent() {
        let t = tracker();
        let w = t.watcher();

        t.update_namespace_egress(42, &["172.17.0.100", "172.17.0.101"]);
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.flush();

        t.update_namespace_egress(42, &["172.17.0.100", "172.17.0.101"]);
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        t.set_node_offline("172.17.0.3", false);
        w.assert_no_changes();

        t.delete_namespace_egress(42);
        w.flush();
        t.delete_namespace_egress(42);
        w.assert_no_changes();
    }

    #[test]
    fn test_multiple_namespace_egress_ips() {
        let t = tracker();
        let w = t.watcher();

        t.update_namespace_egress(42, &["172.17.0.100"]);
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_changes(&[
            "namespace 42 dropped",
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        // prefer .101, which isn't hosted anywhere yet
        t.update_namespace_egress(42, &["172.17.0.101", "172.17.0.100"]);
        w.assert_no_changes();

        t.update_node_egress("172.17.0.4", &["172.17.0.101"]);
        w.assert_changes(&[
            "claim 172.17.0.101 on 172.17.0.4 for namespace 42",
            "namespace 42 via 172.17.0.101 on 172.17.0.4",
        ]);

        t.update_namespace_egress(42, &["172.17.0.100", "172.17.0.101"]);
        w.assert_changes(&["namespace 42 via 172.17.0.100 on 172.17.0.3"]);

        t.update_node_egress("172.17.0.4", &["172.17.0.200"]);
        w.assert_changes(&["release 172.17.0.101 on 172.17.0.4"]);

        t.update_node_egress("172.17.0.3", &[] as &[&str]);
        w.assert_changes(&["release 172.17.0.100 on 172.17.0.3", "namespace 42 dropped"]);

        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        t.update_node_egress("172.17.0.4", &["172.17.0.101"]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "claim 172.17.0.101 on 172.17.0.4 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        // a conflict on any listed IP disables the whole namespace
        t.update_namespace_egress(43, &["172.17.0.100"]);
        w.assert_changes(&[
            "release 172.17.0.100 on 172.17.0.3",
            "namespace 42 dropped",
            "namespace 43 dropped",
        ]);

        t.delete_namespace_egress(43);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
            "namespace 43 normal",
        ]);

        t.update_namespace_egress(44, &["172.17.0.101"]);
        w.assert_changes(&[
            "release 172.17.0.101 on 172.17.0.4",
            "namespace 42 dropped",
            "namespace 44 dropped",
        ]);

        t.delete_namespace_egress(44);
        w.assert_changes(&[
            "claim 172.17.0.101 on 172.17.0.4 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
            "namespace 44 normal",
        ]);
    }

    #[test]
    fn test_same_node_egress_ips_conflict() {
        let t = tracker();
        let w = t.watcher();

        t.update_node_egress("172.17.0.3", &["172.17.0.100", "172.17.0.101"]);
        t.update_namespace_egress(42, &["172.17.0.100", "172.17.0.101"]);
        w.assert_changes(&["namespace 42 dropped"]);

        // moving .101 away settles the conflict for .100 as well
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        t.update_node_egress("172.17.0.4", &["172.17.0.101"]);
        w.assert_changes(&["claim 172.17.0.101 on 172.17.0.4 for namespace 42"]);
    }

    #[test]
    fn test_duplicate_node_egress_ips() {
        let t = tracker();
        let w = t.watcher();

        t.update_namespace_egress(42, &["172.17.0.100"]);
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_changes(&[
            "namespace 42 dropped",
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        t.update_node_egress("172.17.0.4", &["172.17.0.100"]);
        w.assert_changes(&["release 172.17.0.100 on 172.17.0.3", "namespace 42 dropped"]);

        t.update_node_egress("172.17.0.4", &[] as &[&str]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        t.update_node_egress("172.17.0.5", &["172.17.0.100"]);
        w.assert_changes(&["release 172.17.0.100 on 172.17.0.3", "namespace 42 dropped"]);

        t.delete_namespace_egress(42);
        w.assert_changes(&["namespace 42 normal"]);

        t.update_namespace_egress(42, &["172.17.0.100"]);
        w.assert_changes(&["namespace 42 dropped"]);

        t.update_node_egress("172.17.0.3", &[] as &[&str]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.5 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.5",
        ]);
    }

    #[test]
    fn test_duplicate_namespace_egress_ips() {
        let t = tracker();
        let w = t.watcher();

        t.update_namespace_egress(42, &["172.17.0.100"]);
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.flush();

        t.update_namespace_egress(43, &["172.17.0.100"]);
        w.assert_changes(&[
            "release 172.17.0.100 on 172.17.0.3",
            "namespace 42 dropped",
            "namespace 43 dropped",
        ]);

        t.delete_namespace_egress(43);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
            "namespace 43 normal",
        ]);

        t.update_namespace_egress(43, &["172.17.0.100"]);
        w.assert_changes(&[
            "release 172.17.0.100 on 172.17.0.3",
            "namespace 42 dropped",
            "namespace 43 dropped",
        ]);

        t.update_node_egress("172.17.0.3", &[] as &[&str]);
        w.assert_no_changes();
        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        w.assert_no_changes();

        t.delete_namespace_egress(42);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 43",
            "namespace 42 normal",
            "namespace 43 via 172.17.0.100 on 172.17.0.3",
        ]);
    }

    #[test]
    fn test_offline_egress_ips() {
        let t = tracker();
        let w = t.watcher();

        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        t.update_node_egress("172.17.0.4", &["172.17.0.101"]);
        t.update_namespace_egress(42, &["172.17.0.100", "172.17.0.101"]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "claim 172.17.0.101 on 172.17.0.4 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
        ]);

        t.set_node_offline("172.17.0.3", true);
        w.assert_changes(&["namespace 42 via 172.17.0.101 on 172.17.0.4"]);

        t.set_node_offline("172.17.0.4", true);
        w.assert_changes(&["namespace 42 dropped"]);

        t.set_node_offline("172.17.0.4", false);
        w.assert_changes(&["namespace 42 via 172.17.0.101 on 172.17.0.4"]);

        t.set_node_offline("172.17.0.3", false);
        w.assert_changes(&["namespace 42 via 172.17.0.100 on 172.17.0.3"]);

        t.set_node_offline("172.17.0.4", true);
        w.assert_no_changes();
    }

    #[test]
    fn test_single_egress_ip_ignores_offline() {
        let t = tracker();
        let w = t.watcher();

        t.update_node_egress("172.17.0.3", &["172.17.0.100"]);
        t.update_namespace_egress(42, &["172.17.0.100"]);
        w.flush();

        t.set_node_offline("172.17.0.3", true);
        w.assert_no_changes();

        let state = t.lock();
        assert!(state.node_by_ip("172.17.0.3").is_some_and(|n| n.offline));
    }

    #[test]
    fn test_unknown_node_offline_is_ignored() {
        let t = tracker();
        t.set_node_offline("172.17.0.9", true);
        t.watcher().assert_no_changes();
        assert!(t.lock().nodes.is_empty());
    }

    #[test]
    fn test_egress_node_renumbering() {
        let t = tracker();
        let w = t.watcher();

        t.update_host_subnet_egress(&host_subnet("alpha", "172.17.0.3", &["172.17.0.100"]));
        t.update_host_subnet_egress(&host_subnet("beta", "172.17.0.4", &["172.17.0.101"]));
        t.update_host_subnet_egress(&host_subnet("gamma", "172.17.0.5", &["172.17.0.102"]));
        t.update_namespace_egress(42, &["172.17.0.100"]);
        t.update_namespace_egress(43, &["172.17.0.101"]);
        w.assert_changes(&[
            "claim 172.17.0.100 on 172.17.0.3 for namespace 42",
            "namespace 42 via 172.17.0.100 on 172.17.0.3",
            "claim 172.17.0.101 on 172.17.0.4 for namespace 43",
            "namespace 43 via 172.17.0.101 on 172.17.0.4",
        ]);

        t.update_host_subnet_egress(&host_subnet("beta", "172.17.0.6", &["172.17.0.101"]));
        w.assert_changes(&[
            "release 172.17.0.101 on 172.17.0.4",
            "namespace 43 dropped",
            "claim 172.17.0.101 on 172.17.0.6 for namespace 43",
            "namespace 43 via 172.17.0.101 on 172.17.0.6",
        ]);

        let state = t.lock();
        assert!(state.node_by_ip("172.17.0.4").is_none());
        assert_eq!(
            state.node_by_ip("172.17.0.6").map(|n| n.name.as_str()),
            Some("beta")
        );
    }

    #[test]
    fn test_delete_host_subnet_egress() {
        let t = tracker();
        let w = t.watcher();

        t.update_host_subnet_egress(&host_subnet("alpha", "172.17.0.3", &["172.17.0.100"]));
        t.update_namespace_egress(42, &["172.17.0.100"]);
        w.flush();

        t.delete_host_subnet_egress("alpha");
        w.assert_changes(&["release 172.17.0.100 on 172.17.0.3", "namespace 42 dropped"]);
        assert!(t.lock().nodes.is_empty());

        t.delete_host_subnet_egress("alpha");
        w.assert_no_changes();
    }

    #[test]
    fn test_sdn_ip_from_subnet() {
        let t = tracker();
        t.update_host_subnet_egress(&HostSubnetEgress {
            subnet: Some("10.128.2.0/23".into()),
            ..host_subnet("alpha", "172.17.0.3", &["172.17.0.100"])
        });
        t.update_host_subnet_egress(&HostSubnetEgress {
            subnet: Some("not-a-subnet".into()),
            ..host_subnet("beta", "172.17.0.4", &["172.17.0.101"])
        });

        let state = t.lock();
        assert_eq!(state.nodes["alpha"].sdn_ip, "10.128.2.1");
        assert_eq!(state.nodes["beta"].sdn_ip, "172.17.0.4");
    }

    #[test]
    fn test_default_gateway() {
        assert_eq!(
            default_gateway("10.128.0.0/23").unwrap(),
            Ipv4Addr::new(10, 128, 0, 1)
        );
        assert!(matches!(
            default_gateway("255.255.255.255/32"),
            Err(Error::Gateway(_))
        ));
        assert!(matches!(default_gateway("10.128.0.0/33"), Err(Error::Cidr(_))));
    }
}
