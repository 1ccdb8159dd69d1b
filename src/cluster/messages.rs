//! Wire shapes exchanged with the table-manager mailboxes.

use std::collections::BTreeMap;

use crate::cluster::identity::{RaftMemberId, ServerId, TableId};
use crate::cluster::mailbox::Address;
use crate::cluster::raft::RaftPersistentState;
use crate::cluster::table::TableConfig;
use crate::cluster::timestamp::StateTimestamp;

/// Creation or deletion order fanned out to each replica's table manager.
/// `member_id` and `raft_state` are present exactly when `is_drop` is false.
#[derive(Clone, Debug)]
pub struct TableAction {
    pub table: TableId,
    pub timestamp: StateTimestamp,
    pub is_drop: bool,
    pub member_id: Option<RaftMemberId>,
    pub raft_state: Option<RaftPersistentState>,
    pub ack_to: Address<()>,
}

/// Ask a server for the config of one table, or of every table it hosts.
#[derive(Clone, Debug)]
pub struct GetConfigRequest {
    pub table: Option<TableId>,
    pub reply_to: Address<BTreeMap<TableId, TableConfig>>,
}

/// Ask a table's Raft leader to adopt a new config. The reply carries the
/// timestamp of the committed change, or `None` when the leader could not
/// apply it.
#[derive(Clone, Debug)]
pub struct SetConfigRequest {
    pub table: TableId,
    pub config: TableConfig,
    pub reply_to: Address<Option<StateTimestamp>>,
}

/// Mailbox addresses a peer advertises for its table-manager role.
#[derive(Clone, Debug)]
pub struct ManagerBcard {
    pub server_id: ServerId,
    pub get_config: Address<GetConfigRequest>,
    pub set_config: Address<SetConfigRequest>,
    pub action: Address<TableAction>,
}
