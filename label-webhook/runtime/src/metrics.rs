use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    requests: Family<Labels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Allowed,
    Denied,
    Patched,
    Rejected,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    route: &'static str,
    outcome: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<Labels, Counter>::default();
        reg.register(
            "admission_requests",
            "Total number of admission requests handled, by route and outcome",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn record(&self, route: &'static str, outcome: Outcome) {
        self.requests
            .get_or_create(&Labels {
                route,
                outcome: outcome.as_str(),
            })
            .inc();
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Patched => "patched",
            Self::Rejected => "rejected",
        }
    }
}
