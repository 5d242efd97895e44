use amp_core::{Outcome, ResourceId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub resource: ResourceId,
    pub outcome: Outcome,
}

/// Ordered per-resource outcomes of one successful pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub steps: Vec<Step>,
}

impl PassReport {
    pub fn record(&mut self, resource: ResourceId, outcome: Outcome) {
        self.steps.push(Step { resource, outcome });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    /// True when the pass wrote nothing.
    pub fn converged(&self) -> bool {
        self.steps.iter().all(|s| s.outcome == Outcome::Unchanged)
    }

    pub fn outcome_of(&self, id: &ResourceId) -> Option<Outcome> {
        self.steps.iter().find(|s| &s.resource == id).map(|s| s.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_lookup() {
        let mut r = PassReport::default();
        assert!(r.converged());
        r.record(ResourceId::new("Deployment", "amp", "backend-cron"), Outcome::Created);
        r.record(ResourceId::new("Service", "amp", "backend-listener"), Outcome::Unchanged);
        assert_eq!(r.len(), 2);
        assert_eq!(r.count(Outcome::Created), 1);
        assert!(!r.converged());
        assert_eq!(r.outcome_of(&ResourceId::new("Service", "amp", "backend-listener")), Some(Outcome::Unchanged));
        assert_eq!(r.outcome_of(&ResourceId::new("Service", "amp", "missing")), None);
    }
}
