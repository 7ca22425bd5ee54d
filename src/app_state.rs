use crate::simulation::SimulationRecord;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

/// Progress of one server rank.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RankStatus {
    pub not_started: usize,
    pub running: usize,
    pub finished: usize,
    pub dropped: usize,
    /// Data messages folded into accumulators.
    pub messages: u64,
    pub duplicates: u64,
    /// Messages discarded as malformed or unexpected.
    pub rejected: u64,
    /// Messages for dropped groups.
    pub ignored: u64,
    pub checkpoints: u64,
    /// Number of (field, client rank) slots held.
    pub slots: usize,
    pub converged: bool,
}

/// Snapshot served over HTTP.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusReport {
    pub sampling_size: usize,
    pub ranks: BTreeMap<usize, RankStatus>,
    /// Rank 0's view of every group.
    #[serde(skip)]
    pub simulations: Vec<SimulationRecord>,
}

/// Latest status published by the event loops, shared with the HTTP handlers.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    report: Arc<RwLock<StatusReport>>,
}

impl StatusBoard {
    pub fn new(sampling_size: usize) -> Self {
        Self {
            report: Arc::new(RwLock::new(StatusReport {
                sampling_size,
                ..Default::default()
            })),
        }
    }

    pub fn publish_rank(&self, rank: usize, status: RankStatus) {
        let mut report = self.report.write().unwrap_or_else(PoisonError::into_inner);
        report.ranks.insert(rank, status);
    }

    pub fn publish_simulations(&self, simulations: Vec<SimulationRecord>) {
        let mut report = self.report.write().unwrap_or_else(PoisonError::into_inner);
        report.simulations = simulations;
    }

    pub fn snapshot(&self) -> StatusReport {
        self.report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn simulation(&self, simu_id: usize) -> Option<SimulationRecord> {
        self.report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .simulations
            .get(simu_id)
            .cloned()
    }
}

/// Shared application state passed to each HTTP request handler.
pub struct AppState {
    pub status: StatusBoard,
}

impl AppState {
    /// Create and return an [AppState].
    pub fn new(status: StatusBoard) -> Self {
        Self { status }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_are_visible_in_snapshots() {
        let board = StatusBoard::new(8);
        board.publish_rank(
            1,
            RankStatus {
                finished: 3,
                ..Default::default()
            },
        );
        board.publish_simulations(vec![SimulationRecord::default()]);
        let snapshot = board.snapshot();
        assert_eq!(8, snapshot.sampling_size);
        assert_eq!(3, snapshot.ranks[&1].finished);
        assert!(board.simulation(0).is_some());
        assert!(board.simulation(1).is_none());
    }
}
