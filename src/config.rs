//! Runtime limits (normative defaults).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Chunk size for buffered read-ahead on a connection.
    pub io_buffer_bytes: usize,
    /// Capacity of the reactor's readiness event batch.
    pub reactor_events_capacity: usize,
    /// How long a mutating metadata operation waits for the directory to
    /// reflect the change before reporting an unknown outcome.
    pub mutation_wait_ms: u64,
}

impl Limits {
    pub fn mutation_wait(&self) -> Duration {
        Duration::from_millis(self.mutation_wait_ms)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            io_buffer_bytes: 4096,
            reactor_events_capacity: 256,
            mutation_wait_ms: 10_000,
        }
    }
}
