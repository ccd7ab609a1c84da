use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts admission requests by how they were answered.
#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    requests: Family<Labels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Allowed,
    Denied,
    Patched,
    /// Rejected before a review could be decoded.
    Rejected,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    outcome: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<Labels, Counter>::default();
        reg.register(
            "requests",
            "Total number of admission requests by outcome",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.requests
            .get_or_create(&Labels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, outcome: Outcome) -> u64 {
        self.requests
            .get_or_create(&Labels {
                outcome: outcome.as_str(),
            })
            .get()
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Patched => "patched",
            Self::Rejected => "rejected",
        }
    }
}
