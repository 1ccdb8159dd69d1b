//! Raft payloads carried by table actions.
//!
//! Only the persisted-state snapshot and member identities flow through the
//! metadata client; the consensus machinery itself lives elsewhere.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cluster::identity::{RaftMemberId, ServerId};
use crate::cluster::table::TableConfig;

/// Voting membership of one table's Raft cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub voting_members: BTreeSet<RaftMemberId>,
}

/// Replicated state machine contents for one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRaftState {
    pub config: TableConfig,
    pub member_ids: BTreeMap<ServerId, RaftMemberId>,
}

/// What a replica persists before it joins the table's Raft cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPersistentState {
    pub current_term: u64,
    pub voted_for: Option<RaftMemberId>,
    pub snapshot_state: TableRaftState,
    pub snapshot_config: RaftConfig,
}

impl RaftPersistentState {
    /// State handed to every founding replica of a new table.
    pub fn make_initial(state: TableRaftState, config: RaftConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            snapshot_state: state,
            snapshot_config: config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_initial_starts_at_term_zero() {
        let state = TableRaftState {
            config: TableConfig {
                database: "db".into(),
                name: "t".into(),
                primary_key: "id".into(),
                shards: Vec::new(),
            },
            member_ids: BTreeMap::new(),
        };
        let config = RaftConfig {
            voting_members: BTreeSet::new(),
        };
        let ps = RaftPersistentState::make_initial(state.clone(), config.clone());
        assert_eq!(ps.current_term, 0);
        assert_eq!(ps.voted_for, None);
        assert_eq!(ps.snapshot_state, state);
        assert_eq!(ps.snapshot_config, config);
    }
}
