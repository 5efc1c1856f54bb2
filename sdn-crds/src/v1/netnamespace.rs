use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_NETNAMESPACE: &str = "netnamespaces.sdn.network.dev";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "sdn.network.dev",
    version = "v1",
    kind = "NetNamespace",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct NetNamespaceSpec {
    /// Name of the Kubernetes namespace this network belongs to
    pub net_name: String,

    /// VNID of the namespace
    #[serde(rename = "netID")]
    pub net_id: u32,

    /// Egress IPs in order of preference
    #[serde(rename = "egressIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub egress_ips: Vec<String>,
}
