#![forbid(unsafe_code)]

//! Clustering and networking core for the Shoal distributed database.
//!
//! Two layers, bottom-up:
//!
//! - [`net`]: a single-threaded, nonblocking connection and listener engine
//!   driven by an epoll-style readiness poller.
//! - [`cluster`]: a table metadata client that discovers, queries, and
//!   mutates replicated per-table configuration across a cluster of peers
//!   through scoped mailboxes and an eventually-consistent directory.

pub mod cluster;
pub mod config;
pub mod error;
pub mod net;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::config::Limits;

// Re-export the working set at the crate root for convenience
pub use crate::cluster::{
    Address, Epoch, GetConfigRequest, Interrupted, Mailbox, MailboxManager, ManagerBcard,
    MutationOutcome, PeerId, RaftConfig, RaftMemberId, RaftPersistentState, ServerId,
    SetConfigRequest, ShardConfig, Signal, StateTimestamp, TableAction, TableBcard, TableConfig,
    TableId, TableMeta, TableMetaClient, TableRaftState, WatchableMap,
};
pub use crate::net::{
    AcceptHandler, ConnCtx, Connection, EventMask, Listener, PollTarget, Poller, Reactor,
    ReadBufferedHandler, ReadExactHandler, WriteExactHandler,
};
