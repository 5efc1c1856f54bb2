use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::tracker::{EgressIpInfo, EgressIpTracker, NodeEgress, TrackerState};
use crate::{EgressCidrNodes, EgressIpWatcher};

/// Egress IPs each node with egress CIDRs should host, keyed by node name.
pub type EgressAllocation = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgressCidrNode {
    pub node_ip: String,
    pub offline: bool,
}

impl<W: EgressIpWatcher> EgressIpTracker<W> {
    /// Nodes with usable egress CIDRs, in node name order.
    pub fn egress_cidr_nodes(&self) -> Vec<EgressCidrNode> {
        self.lock()
            .nodes
            .values()
            .filter(|node| !node.parsed_cidrs.is_empty())
            .map(|node| EgressCidrNode {
                node_ip: node.node_ip.clone(),
                offline: node.offline,
            })
            .collect()
    }

    /// Computes where automatically allocated egress IPs should live.
    ///
    /// Every node with egress CIDRs gets an entry, offline nodes included.
    /// IPs currently hosted somewhere else are left alone this round, so
    /// moving an IP takes two rounds: one to release it and one to place it.
    pub fn reallocate_egress_ips(&self) -> EgressAllocation {
        self.lock().reallocate_egress_ips()
    }
}

impl<W: EgressIpWatcher> EgressCidrNodes for EgressIpTracker<W> {
    fn egress_cidr_nodes(&self) -> Vec<EgressCidrNode> {
        EgressIpTracker::egress_cidr_nodes(self)
    }
}

impl TrackerState {
    fn reallocate_egress_ips(&self) -> EgressAllocation {
        let mut allocation: EgressAllocation = self
            .nodes
            .values()
            .filter(|node| !node.parsed_cidrs.is_empty())
            .map(|node| (node.name.clone(), Vec::new()))
            .collect();
        let mut kept = BTreeSet::new();

        for (ip, eg) in &self.egress_ips {
            let Some(node_ip) = &eg.assigned_node_ip else {
                continue;
            };
            if !self.auto_allocatable(eg) {
                continue;
            }
            let Some(node) = self.node_by_ip(node_ip) else {
                continue;
            };
            if node.offline || !eg.parsed.is_some_and(|addr| node.contains(addr)) {
                continue;
            }
            if let Some(ips) = allocation.get_mut(&node.name) {
                ips.push(ip.clone());
                kept.insert(ip.as_str());
            }
        }

        let pending: Vec<(&str, Ipv4Addr)> = self
            .egress_ips
            .iter()
            .filter(|(_, eg)| {
                eg.assigned_node_ip.is_none() && eg.nodes.is_empty() && self.auto_allocatable(eg)
            })
            .filter_map(|(ip, eg)| Some((ip.as_str(), eg.parsed?)))
            .collect();

        // IPs with a single possible home go first so that they are not
        // crowded out by IPs that could have gone elsewhere.
        let mut flexible = Vec::new();
        for (ip, addr) in pending {
            let mut fitting = self.fitting_nodes(addr);
            match (fitting.next(), fitting.next()) {
                (Some(node), None) => {
                    if let Some(ips) = allocation.get_mut(&node.name) {
                        ips.push(ip.to_string());
                    }
                }
                (Some(_), Some(_)) => flexible.push((ip, addr)),
                _ => debug!(egress_ip = ip, "no online node can host egress IP"),
            }
        }
        for (ip, addr) in flexible {
            let least_loaded = self
                .fitting_nodes(addr)
                .min_by_key(|node| allocation.get(&node.name).map_or(usize::MAX, Vec::len));
            if let Some(node) = least_loaded
                && let Some(ips) = allocation.get_mut(&node.name)
            {
                ips.push(ip.to_string());
            }
        }

        self.rebalance(&mut allocation, &kept);
        allocation
    }

    /// Only namespaces with exactly one egress IP get it allocated
    /// automatically. Multiple IPs are a manual high-availability setup.
    fn auto_allocatable(&self, eg: &EgressIpInfo) -> bool {
        match eg.namespaces.as_slice() {
            [vnid] => self
                .namespaces
                .get(vnid)
                .is_some_and(|ns| ns.requested_ips.len() == 1),
            _ => false,
        }
    }

    fn fitting_nodes(&self, addr: Ipv4Addr) -> impl Iterator<Item = &NodeEgress> {
        self.nodes
            .values()
            .filter(move |node| !node.offline && node.contains(addr))
    }

    /// Gives online nodes that host nothing a share of the kept IPs, so a
    /// node that comes back does not stay empty forever.
    fn rebalance(&self, allocation: &mut EgressAllocation, kept: &BTreeSet<&str>) {
        let online: Vec<&NodeEgress> = self
            .nodes
            .values()
            .filter(|node| !node.offline && !node.parsed_cidrs.is_empty())
            .collect();
        let load = |allocation: &EgressAllocation, name: &str| allocation.get(name).map_or(0, Vec::len);

        let empty: Vec<&NodeEgress> = online
            .iter()
            .copied()
            .filter(|node| load(allocation, &node.name) == 0)
            .collect();
        if empty.is_empty() || online.len() < 2 {
            return;
        }

        let total: usize = online.iter().map(|node| load(allocation, &node.name)).sum();
        let target = total.div_ceil(online.len());
        let mut projected: BTreeMap<&str, usize> =
            empty.iter().map(|node| (node.name.as_str(), 0)).collect();

        let mut donors: Vec<&str> = online
            .iter()
            .map(|node| node.name.as_str())
            .filter(|name| load(allocation, name) > target)
            .collect();
        donors.sort_by(|a, b| {
            load(allocation, b)
                .cmp(&load(allocation, a))
                .then_with(|| a.cmp(b))
        });

        for donor in donors {
            let Some(ips) = allocation.get(donor) else {
                continue;
            };
            let mut remaining = ips.len();
            let mut released = Vec::new();
            for ip in ips {
                if remaining <= target {
                    break;
                }
                if !kept.contains(ip.as_str()) {
                    continue;
                }
                let Some(addr) = self.egress_ips.get(ip).and_then(|eg| eg.parsed) else {
                    continue;
                };
                let receiver = empty.iter().find(|node| {
                    node.contains(addr) && projected.get(node.name.as_str()).is_some_and(|n| *n < target)
                });
                if let Some(receiver) = receiver {
                    if let Some(n) = projected.get_mut(receiver.name.as_str()) {
                        *n += 1;
                    }
                    released.push(ip.clone());
                    remaining -= 1;
                }
            }
            if released.is_empty() {
                continue;
            }
            info!(node = donor, ?released, "rebalancing egress IPs");
            if let Some(ips) = allocation.get_mut(donor) {
                ips.retain(|ip| !released.contains(ip));
            }
        }
    }
}
