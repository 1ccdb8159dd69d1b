//! Table configuration and directory advertisements.

use serde::{Deserialize, Serialize};

use crate::cluster::identity::ServerId;
use crate::cluster::timestamp::StateTimestamp;

/// One shard's replica placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub replicas: Vec<ServerId>,
    pub primary: ServerId,
}

/// User-visible configuration of a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub database: String,
    pub name: String,
    pub primary_key: String,
    pub shards: Vec<ShardConfig>,
}

impl TableConfig {
    /// Every server that appears in some shard's replica set.
    pub fn all_replicas(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.shards.iter().flat_map(|shard| {
            shard.replicas.iter().copied()
        })
    }
}

/// What one peer advertises about one table in the cluster directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBcard {
    pub database: String,
    pub name: String,
    pub primary_key: String,
    pub timestamp: StateTimestamp,
    pub is_leader: bool,
}
