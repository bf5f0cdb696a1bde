use std::collections::{HashMap, HashSet, VecDeque};

use trading_core::CorrelationId;

use crate::gateway::ExecutionReport;

/// Terminal outcomes keyed by correlation id, bounded in size.
/// A correlation id found here is never sent to the broker again.
#[derive(Debug)]
pub struct IdempotencyLedger {
    outcomes: HashMap<CorrelationId, ExecutionReport>,
    order: VecDeque<CorrelationId>,
    in_flight: HashSet<CorrelationId>,
    capacity: usize,
}

impl IdempotencyLedger {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            in_flight: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, id: &CorrelationId) -> Option<&ExecutionReport> {
        self.outcomes.get(id)
    }

    pub fn is_in_flight(&self, id: &CorrelationId) -> bool {
        self.in_flight.contains(id)
    }

    /// Claim an id for execution. False if it is already running or done.
    pub fn begin(&mut self, id: CorrelationId) -> bool {
        if self.outcomes.contains_key(&id) {
            return false;
        }
        self.in_flight.insert(id)
    }

    pub fn record(&mut self, report: ExecutionReport) {
        let id = report.correlation_id;
        self.in_flight.remove(&id);
        if self.outcomes.insert(id, report).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
