//! Supersedes-ordered configuration timestamps.
//!
//! Every advertised table state carries a [`StateTimestamp`]; when two peers
//! disagree, the higher timestamp wins. The order is total: epochs compare
//! by wall microseconds with the epoch id as a deterministic tiebreak, and
//! within an epoch the Raft log index decides.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lineage of a table's configuration: wall-clock microseconds plus a
/// uniquifying id minted when the lineage began.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub microtime: u64,
    pub id: Uuid,
}

impl Epoch {
    pub fn now(id: Uuid) -> Self {
        Self {
            microtime: now_micros(),
            id,
        }
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.microtime
            .cmp(&other.microtime)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Totally ordered timestamp of a table's replicated state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTimestamp {
    pub epoch: Epoch,
    pub log_index: u64,
}

impl StateTimestamp {
    pub fn new(epoch: Epoch, log_index: u64) -> Self {
        Self { epoch, log_index }
    }

    /// Synthetic timestamp that outranks every timestamp a live table can
    /// carry, so a deletion wins any race against in-flight rebalancing.
    pub fn deletion() -> Self {
        Self {
            epoch: Epoch {
                microtime: u64::MAX,
                id: Uuid::nil(),
            },
            log_index: u64::MAX,
        }
    }

    pub fn supersedes(&self, other: &StateTimestamp) -> bool {
        self > other
    }
}

impl PartialOrd for StateTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StateTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.log_index.cmp(&other.log_index))
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
