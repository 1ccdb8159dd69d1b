//! Table metadata client and the cluster fabric it rides on.

pub mod directory;
pub mod identity;
pub mod mailbox;
pub mod messages;
pub mod meta_client;
pub mod raft;
pub mod signal;
pub mod table;
pub mod timestamp;

pub use directory::{WaitError, WatchableMap};
pub use identity::{PeerId, RaftMemberId, ServerId, TableId};
pub use mailbox::{Address, Mailbox, MailboxManager};
pub use messages::{GetConfigRequest, ManagerBcard, SetConfigRequest, TableAction};
pub use meta_client::{FindError, MutationOutcome, TableMeta, TableMetaClient};
pub use raft::{RaftConfig, RaftPersistentState, TableRaftState};
pub use signal::{Interrupted, Signal};
pub use table::{ShardConfig, TableBcard, TableConfig};
pub use timestamp::{Epoch, StateTimestamp};
