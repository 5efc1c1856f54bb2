use kube::runtime::watcher::Event;
use sdn_crds::v1::hostsubnet::HostSubnet;
use sdn_crds::v1::netnamespace::NetNamespace;
use sdn_egressip::{EgressIpTracker, EgressIpWatcher, HostSubnetEgress};
use tracing::trace;

pub fn host_subnet_egress(host_subnet: &HostSubnet) -> HostSubnetEgress {
    let spec = &host_subnet.spec;
    HostSubnetEgress {
        node_name: host_subnet.node_name(),
        host_ip: spec.host_ip.clone(),
        subnet: Some(spec.subnet.clone()).filter(|subnet| !subnet.is_empty()),
        egress_ips: spec.egress_ips.clone(),
        egress_cidrs: spec.egress_cidrs.clone(),
    }
}

/// VNID and egress IPs of a namespace.
pub fn net_namespace_egress(net_namespace: &NetNamespace) -> (u32, &[String]) {
    (net_namespace.spec.net_id, &net_namespace.spec.egress_ips)
}

pub fn handle_host_subnet_event<W: EgressIpWatcher>(
    tracker: &EgressIpTracker<W>,
    event: Event<HostSubnet>,
) {
    match event {
        Event::Apply(host_subnet) | Event::InitApply(host_subnet) => {
            trace!(node = %host_subnet.node_name(), "host subnet applied");
            tracker.update_host_subnet_egress(&host_subnet_egress(&host_subnet));
        }
        Event::Delete(host_subnet) => {
            trace!(node = %host_subnet.node_name(), "host subnet deleted");
            tracker.delete_host_subnet_egress(&host_subnet.node_name());
        }
        Event::Init | Event::InitDone => {}
    }
}

pub fn handle_net_namespace_event<W: EgressIpWatcher>(
    tracker: &EgressIpTracker<W>,
    event: Event<NetNamespace>,
) {
    match event {
        Event::Apply(net_namespace) | Event::InitApply(net_namespace) => {
            let (vnid, egress_ips) = net_namespace_egress(&net_namespace);
            tracker.update_namespace_egress(vnid, egress_ips);
        }
        Event::Delete(net_namespace) => {
            tracker.delete_namespace_egress(net_namespace.spec.net_id);
        }
        Event::Init | Event::InitDone => {}
    }
}
