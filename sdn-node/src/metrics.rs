use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("sdn_egress")));

static EGRESS_METRICS: LazyLock<EgressMetrics> = LazyLock::new(|| {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    EgressMetrics::new(&mut registry)
});

#[derive(Clone, Debug)]
pub struct EgressMetrics {
    pub callbacks: Family<CallbackLabels, Counter>,
    pub liveness_transitions: Family<TransitionLabels, Counter>,
    pub flow_dump_failures: Counter,
    pub monitored_nodes: Gauge,
}

impl EgressMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let callbacks = Family::<CallbackLabels, Counter>::default();
        let liveness_transitions = Family::<TransitionLabels, Counter>::default();
        let flow_dump_failures = Counter::default();
        let monitored_nodes = Gauge::default();

        registry.register(
            "callbacks",
            "Egress IP decisions handed to the dataplane",
            callbacks.clone(),
        );
        registry.register(
            "liveness_transitions",
            "Egress nodes marked offline or back online",
            liveness_transitions.clone(),
        );
        registry.register(
            "flow_dump_failures",
            "Failed VXLAN flow counter dumps",
            flow_dump_failures.clone(),
        );
        registry.register(
            "monitored_nodes",
            "Egress nodes watched for VXLAN liveness",
            monitored_nodes.clone(),
        );
        Self {
            callbacks,
            liveness_transitions,
            flow_dump_failures,
            monitored_nodes,
        }
    }

    /// The metrics of the process wide registry served on `/metrics`,
    /// registered on first use.
    pub fn register() -> Self {
        EGRESS_METRICS.clone()
    }

    pub fn count_callback(&self, callback: &str) {
        self.callbacks
            .get_or_create(&CallbackLabels {
                callback: callback.to_string(),
            })
            .inc();
    }

    pub fn count_transition(&self, offline: bool) {
        let state = if offline { "offline" } else { "online" };
        self.liveness_transitions
            .get_or_create(&TransitionLabels {
                state: state.to_string(),
            })
            .inc();
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallbackLabels {
    pub callback: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub state: String,
}
