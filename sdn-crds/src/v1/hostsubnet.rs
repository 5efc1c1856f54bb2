use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_HOSTSUBNET: &str = "hostsubnets.sdn.network.dev";

/// Per-node allocation of the pod overlay network, along with the egress IPs
/// the node hosts and the CIDRs it may be handed egress IPs from.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "sdn.network.dev",
    version = "v1",
    kind = "HostSubnet",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct HostSubnetSpec {
    /// Name of the node
    pub host: String,

    /// Routable IP of the node
    #[serde(rename = "hostIP")]
    pub host_ip: String,

    /// Pod subnet assigned to the node, in CIDR notation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnet: String,

    /// Egress IPs the node should host
    #[serde(rename = "egressIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub egress_ips: Vec<String>,

    /// Ranges that egress IPs may be automatically allocated to the node from
    #[serde(rename = "egressCIDRs", default, skip_serializing_if = "Vec::is_empty")]
    pub egress_cidrs: Vec<String>,
}

impl HostSubnet {
    /// Node name, falling back to the object name when `host` is unset.
    pub fn node_name(&self) -> String {
        if self.spec.host.is_empty() {
            self.name_any()
        } else {
            self.spec.host.clone()
        }
    }
}
