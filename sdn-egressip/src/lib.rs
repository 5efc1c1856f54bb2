mod allocation;
mod ping;
mod tracker;

use std::time::Duration;

use async_trait::async_trait;

pub use allocation::{EgressAllocation, EgressCidrNode};
pub use tracker::{EgressIpTracker, HostSubnetEgress};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid egress CIDR: {0}")]
    Cidr(#[from] ipnetwork::IpNetworkError),

    #[error("node subnet {0} has no usable gateway address")]
    Gateway(String),

    #[error("multiple nodes ({first}, {second}) claiming egress IP {egress_ip}")]
    MultipleNodes {
        egress_ip: String,
        first: String,
        second: String,
    },

    #[error("multiple namespaces ({first}, {second}) claiming egress IP {egress_ip}")]
    MultipleNamespaces {
        egress_ip: String,
        first: u32,
        second: u32,
    },

    #[error(
        "namespace {vnid} has egress IPs {first} and {second} both hosted on node {node_ip}"
    )]
    SameNodeEgressIps {
        vnid: u32,
        first: String,
        second: String,
        node_ip: String,
    },
}

/// Receives the decisions of an [`EgressIpTracker`].
///
/// Callbacks run while the tracker lock is held. They must not call back into
/// the tracker and should hand any slow work off to another task.
pub trait EgressIpWatcher: Send + Sync {
    /// `egress_ip` should now be hosted on `node_ip` for namespace `vnid`.
    fn claim_egress_ip(&self, vnid: u32, egress_ip: &str, node_ip: &str);

    /// `egress_ip` is no longer hosted on `node_ip`.
    fn release_egress_ip(&self, egress_ip: &str, node_ip: &str);

    /// Traffic from `vnid` leaves through the normal node path.
    fn set_namespace_egress_normal(&self, vnid: u32);

    /// Traffic from `vnid` to external destinations is dropped.
    fn set_namespace_egress_dropped(&self, vnid: u32);

    /// Traffic from `vnid` leaves through `egress_ip` on `node_ip`.
    fn set_namespace_egress_via_egress_ip(&self, vnid: u32, egress_ip: &str, node_ip: &str);

    /// Egress IP placement may have changed for nodes with egress CIDRs.
    /// Only the allocating controller cares about this.
    fn update_egress_cidrs(&self) {}
}

/// The part of the tracker that the VXLAN liveness monitor drives.
#[async_trait]
pub trait NodeLiveness: Send + Sync {
    fn set_node_offline(&self, node_ip: &str, offline: bool);

    /// Returns false only when the node did not answer within `timeout`.
    async fn ping(&self, ip: &str, timeout: Duration) -> bool;
}

/// Liveness of the nodes that automatically allocated egress IPs can be
/// placed on, whether or not they host any right now.
pub trait EgressCidrNodes: NodeLiveness {
    fn egress_cidr_nodes(&self) -> Vec<EgressCidrNode>;
}
