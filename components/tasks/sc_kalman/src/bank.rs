use crate::{AxisFilter, AxisId, Estimate, KalmanParams};
use std::collections::BTreeMap;
use std::time::Duration;

/// One filter per filtered axis, indexed by motor id.
///
/// Iteration is always in ascending id order, which is the order the bank is
/// fed in on every cycle.
#[derive(Debug, Clone, Default)]
pub struct EstimatorBank {
    filters: BTreeMap<AxisId, AxisFilter>,
}

impl EstimatorBank {
    pub fn new(ids: impl IntoIterator<Item = AxisId>, params: KalmanParams) -> Self {
        let filters = ids
            .into_iter()
            .map(|id| (id, AxisFilter::new(params)))
            .collect();
        Self { filters }
    }

    pub fn ids(&self) -> impl Iterator<Item = AxisId> + '_ {
        self.filters.keys().copied()
    }

    pub fn contains(&self, id: AxisId) -> bool {
        self.filters.contains_key(&id)
    }

    pub fn filter(&self, id: AxisId) -> Option<&AxisFilter> {
        self.filters.get(&id)
    }

    pub fn estimate(&self, id: AxisId) -> Option<Estimate> {
        self.filters.get(&id).map(AxisFilter::estimate)
    }

    /// Runs one cycle: every filter is visited exactly once, fusing the
    /// sample `sample(id)` returns or coasting when it returns `None`.
    pub fn feed<F>(&mut self, now: Duration, mut sample: F) -> Vec<(AxisId, Estimate)>
    where
        F: FnMut(AxisId) -> Option<f64>,
    {
        self.filters
            .iter_mut()
            .map(|(&id, filter)| {
                let estimate = match sample(id) {
                    Some(z) => filter.observe(z, now),
                    None => filter.coast(now),
                };
                (id, estimate)
            })
            .collect()
    }

    /// Coasts every filter, used when a whole cycle produced no samples.
    pub fn coast_all(&mut self, now: Duration) {
        for filter in self.filters.values_mut() {
            filter.coast(now);
        }
    }

    pub fn reset(&mut self) {
        for filter in self.filters.values_mut() {
            filter.reset();
        }
    }

    /// Forgets one axis, e.g. after its position frame moved.
    pub fn reset_axis(&mut self, id: AxisId) {
        if let Some(filter) = self.filters.get_mut(&id) {
            filter.reset();
        }
    }
}
