//! Client for creating, dropping, and reconfiguring tables across the
//! cluster.
//!
//! The client watches the `(peer, table)` directory and reduces it into a
//! per-table view with witness sets; lookups read that view synchronously.
//! Mutations fan out to the advertised manager mailboxes, count acks under
//! per-peer disconnect watchers, and then wait for the directory to reflect
//! the change before reporting a definite outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::directory::{WaitError, WatchableMap};
use crate::cluster::identity::{PeerId, RaftMemberId, ServerId, TableId};
use crate::cluster::mailbox::{Address, MailboxManager};
use crate::cluster::messages::{GetConfigRequest, ManagerBcard, SetConfigRequest, TableAction};
use crate::cluster::raft::{RaftConfig, RaftPersistentState, TableRaftState};
use crate::cluster::signal::{Interrupted, Signal};
use crate::cluster::table::{TableBcard, TableConfig};
use crate::cluster::timestamp::{Epoch, StateTimestamp};

/// Outcome of a mutating metadata operation.
///
/// Under partial failure the cluster may or may not have applied the change;
/// `Maybe` reports exactly that, while `Failure` means the operation
/// definitely did not happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    Success,
    Maybe,
    Failure,
}

impl MutationOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, MutationOutcome::Success)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FindError {
    #[error("no table named `{database}.{name}`")]
    NoSuchTable { database: String, name: String },
    #[error("`{database}.{name}` names {count} tables")]
    Ambiguous {
        database: String,
        name: String,
        count: usize,
    },
}

/// Reduction of everything the cluster says about one table.
///
/// `witnesses` is the set of peers currently advertising the table; the
/// remaining fields come from the witness with the highest timestamp seen so
/// far. `primary_key` is carried from the first advertisement and never
/// overwritten on supersede: primary keys are assumed immutable after
/// creation, and that assumption is validated elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMeta {
    pub witnesses: BTreeSet<PeerId>,
    pub database: String,
    pub name: String,
    pub primary_key: String,
    pub timestamp: StateTimestamp,
}

type TableKey = (PeerId, TableId);

pub struct TableMetaClient {
    manager: MailboxManager,
    manager_directory: WatchableMap<PeerId, ManagerBcard>,
    table_directory: WatchableMap<TableKey, TableBcard>,
    tables: WatchableMap<TableId, TableMeta>,
    mutation_wait: Duration,
}

impl TableMetaClient {
    pub fn new(
        manager: MailboxManager,
        manager_directory: WatchableMap<PeerId, ManagerBcard>,
        table_directory: WatchableMap<TableKey, TableBcard>,
        limits: &crate::config::Limits,
    ) -> Self {
        let tables: WatchableMap<TableId, TableMeta> = WatchableMap::new();
        let reduction = tables.clone();
        table_directory.subscribe(move |key, value| {
            apply_directory_delta(&reduction, key, value);
        });
        Self {
            manager,
            manager_directory,
            table_directory,
            tables,
            mutation_wait: limits.mutation_wait(),
        }
    }

    /// Resolve `database.name` to a table id; fails unless the pair names
    /// exactly one table.
    pub fn find(&self, database: &str, name: &str) -> Result<TableId, FindError> {
        let mut count = 0usize;
        let mut found = None;
        self.tables.read_all(|id, meta| {
            if meta.database == database && meta.name == name {
                count += 1;
                found = Some(*id);
            }
        });
        match (count, found) {
            (1, Some(id)) => Ok(id),
            (0, _) => Err(FindError::NoSuchTable {
                database: database.to_string(),
                name: name.to_string(),
            }),
            (count, _) => Err(FindError::Ambiguous {
                database: database.to_string(),
                name: name.to_string(),
                count,
            }),
        }
    }

    pub fn get_name(&self, table: TableId) -> Option<(String, String)> {
        self.tables.read_key(&table, |meta| {
            meta.map(|meta| (meta.database.clone(), meta.name.clone()))
        })
    }

    pub fn list_names(&self) -> BTreeMap<TableId, (String, String)> {
        let mut names = BTreeMap::new();
        self.tables.read_all(|id, meta| {
            names.insert(*id, (meta.database.clone(), meta.name.clone()));
        });
        names
    }

    /// Snapshot of the reduced view of one table.
    pub fn read_table(&self, table: TableId) -> Option<TableMeta> {
        self.tables.read_key(&table, |meta| meta.cloned())
    }

    /// Fetch the config of `table` from the best peer currently hosting it.
    /// `Ok(None)` means no reachable peer claims the table any more.
    pub fn get_config(
        &self,
        table: TableId,
        interruptor: &Signal,
    ) -> Result<Option<TableConfig>, Interrupted> {
        // Pick the hosting peer with the freshest advertisement. Ties keep
        // the first candidate in directory iteration order.
        let mut best: Option<(PeerId, Address<GetConfigRequest>, StateTimestamp)> = None;
        self.table_directory.read_all(|key, table_bcard| {
            if key.1 != table {
                return;
            }
            self.manager_directory.read_key(&key.0, |server_bcard| {
                if let Some(server_bcard) = server_bcard {
                    let better = match &best {
                        None => true,
                        Some((_, _, current)) => table_bcard.timestamp.supersedes(current),
                    };
                    if better {
                        best = Some((
                            key.0,
                            server_bcard.get_config.clone(),
                            table_bcard.timestamp,
                        ));
                    }
                }
            });
        });
        let Some((peer, addr, _)) = best else {
            return Ok(None);
        };

        let watcher = self.manager.disconnect_watcher(peer);
        let (reply, reply_to) = self.manager.mailbox::<BTreeMap<TableId, TableConfig>>();
        self.manager.send(
            &addr,
            GetConfigRequest {
                table: Some(table),
                reply_to,
            },
        );

        if interruptor.is_pulsed() {
            return Err(Interrupted);
        }
        let reply_rx = reply.receiver().clone();
        let disconnect_rx = watcher.watch();
        let interrupt_rx = interruptor.watch();
        crossbeam::select! {
            recv(reply_rx) -> msg => match msg {
                Ok(mut configs) => {
                    if configs.is_empty() {
                        // The table moved away between the scan and the
                        // reply.
                        return Ok(None);
                    }
                    assert!(
                        configs.len() == 1 && configs.contains_key(&table),
                        "get_config reply must contain exactly the requested table"
                    );
                    Ok(configs.remove(&table))
                }
                Err(_) => Ok(None),
            },
            recv(disconnect_rx) -> _ => Ok(None),
            recv(interrupt_rx) -> _ => Err(Interrupted),
        }
    }

    /// Collect the configs of every table hosted anywhere in the cluster.
    /// Peers that disconnect mid-collection simply contribute nothing.
    pub fn list_configs(
        &self,
        interruptor: &Signal,
    ) -> Result<BTreeMap<TableId, TableConfig>, Interrupted> {
        let mut addresses: Vec<Address<GetConfigRequest>> = Vec::new();
        self.manager_directory.read_all(|_, bcard| {
            addresses.push(bcard.get_config.clone());
        });

        let configs = Mutex::new(BTreeMap::new());
        let configs_ref = &configs;
        thread::scope(|scope| {
            for addr in &addresses {
                scope.spawn(move || {
                    let watcher = self.manager.disconnect_watcher(addr.peer());
                    let (reply, reply_to) = self.manager.mailbox::<BTreeMap<TableId, TableConfig>>();
                    self.manager.send(addr, GetConfigRequest {
                        table: None,
                        reply_to,
                    });
                    let reply_rx = reply.receiver().clone();
                    let disconnect_rx = watcher.watch();
                    let interrupt_rx = interruptor.watch();
                    crossbeam::select! {
                        recv(reply_rx) -> msg => {
                            if let Ok(mut peer_configs) = msg {
                                configs_ref
                                    .lock()
                                    .unwrap_or_else(|err| err.into_inner())
                                    .append(&mut peer_configs);
                            }
                        }
                        recv(disconnect_rx) -> _ => {}
                        recv(interrupt_rx) -> _ => {}
                    }
                });
            }
        });

        // The fan-out swallows interruption so every reachable peer can
        // still contribute; surface it here instead.
        if interruptor.is_pulsed() {
            return Err(Interrupted);
        }
        Ok(configs.into_inner().unwrap_or_else(|err| err.into_inner()))
    }

    /// Create a table with `initial_config` on the replicas it names.
    ///
    /// Returns the generated table id together with the outcome. `Maybe`
    /// means at least one replica was contacted but none confirmed, or the
    /// directory did not reflect the table within the wait window.
    pub fn create(
        &self,
        initial_config: &TableConfig,
        interruptor: &Signal,
    ) -> Result<(MutationOutcome, TableId), Interrupted> {
        let table = TableId::fresh();
        let timestamp = StateTimestamp::new(Epoch::now(Uuid::new_v4()), 0);

        let replicas: BTreeSet<ServerId> = initial_config.all_replicas().collect();
        let mut member_ids: BTreeMap<ServerId, RaftMemberId> = BTreeMap::new();
        let mut raft_config = RaftConfig {
            voting_members: BTreeSet::new(),
        };
        for server in &replicas {
            let member = RaftMemberId::fresh();
            member_ids.insert(*server, member);
            raft_config.voting_members.insert(member);
        }
        let raft_state = TableRaftState {
            config: initial_config.clone(),
            member_ids: member_ids.clone(),
        };
        let raft_ps = RaftPersistentState::make_initial(raft_state, raft_config);

        let bcards = self.bcards_for_servers(&replicas);
        debug!(%table, replicas = replicas.len(), reachable = bcards.len(), "creating table");

        let num_acked =
            self.fan_out_action(&bcards, interruptor, |server, _bcard, ack_to| TableAction {
                table,
                timestamp,
                is_drop: false,
                member_id: Some(
                    member_ids
                        .get(server)
                        .copied()
                        .expect("member id minted for every replica"),
                ),
                raft_state: Some(raft_ps.clone()),
                ack_to,
            });
        if interruptor.is_pulsed() {
            return Err(Interrupted);
        }

        if num_acked > 0 {
            // The table may never appear if it is dropped right away or we
            // lose the cluster, hence the window.
            match self.tables.run_key_until_satisfied(
                &table,
                |meta| meta.is_some(),
                interruptor,
                Some(self.mutation_wait),
            ) {
                Ok(()) => Ok((MutationOutcome::Success, table)),
                Err(WaitError::TimedOut) => Ok((MutationOutcome::Maybe, table)),
                Err(WaitError::Interrupted) => Err(Interrupted),
            }
        } else if !bcards.is_empty() {
            Ok((MutationOutcome::Maybe, table))
        } else {
            Ok((MutationOutcome::Failure, table))
        }
    }

    /// Delete `table` everywhere. The deletion timestamp outranks any real
    /// one, so an in-flight rebalancing resolves in favor of the drop.
    pub fn drop_table(
        &self,
        table: TableId,
        interruptor: &Signal,
    ) -> Result<MutationOutcome, Interrupted> {
        let drop_timestamp = StateTimestamp::deletion();

        // Target every server still advertising the table, not just its
        // configured replicas; anyone who claims it must forget it.
        let mut hosting: BTreeSet<PeerId> = BTreeSet::new();
        self.table_directory.read_all(|key, _| {
            if key.1 == table {
                hosting.insert(key.0);
            }
        });
        let mut bcards: BTreeMap<ServerId, ManagerBcard> = BTreeMap::new();
        for peer in &hosting {
            self.manager_directory.read_key(peer, |bcard| {
                if let Some(bcard) = bcard {
                    bcards.insert(bcard.server_id, bcard.clone());
                }
            });
        }
        debug!(%table, targets = bcards.len(), "dropping table");

        let num_acked = self.fan_out_action(&bcards, interruptor, |_, _, ack_to| TableAction {
            table,
            timestamp: drop_timestamp,
            is_drop: true,
            member_id: None,
            raft_state: None,
            ack_to,
        });
        if interruptor.is_pulsed() {
            return Err(Interrupted);
        }

        if num_acked > 0 {
            match self.tables.run_key_until_satisfied(
                &table,
                |meta| meta.is_none(),
                interruptor,
                Some(self.mutation_wait),
            ) {
                Ok(()) => Ok(MutationOutcome::Success),
                Err(WaitError::TimedOut) => Ok(MutationOutcome::Maybe),
                Err(WaitError::Interrupted) => Err(Interrupted),
            }
        } else if !bcards.is_empty() {
            Ok(MutationOutcome::Maybe)
        } else {
            Ok(MutationOutcome::Failure)
        }
    }

    /// Hand `new_config` to the table's Raft leader and wait until the
    /// directory reflects the change.
    ///
    /// If the table is dropped while this waits, the result is `Success`:
    /// the config the caller wanted to replace is no longer relevant.
    pub fn set_config(
        &self,
        table: TableId,
        new_config: &TableConfig,
        interruptor: &Signal,
    ) -> Result<MutationOutcome, Interrupted> {
        // Find the acting leader with the freshest advertisement.
        let mut best: Option<(PeerId, Address<SetConfigRequest>, StateTimestamp)> = None;
        self.table_directory.read_all(|key, table_bcard| {
            if key.1 != table || !table_bcard.is_leader {
                return;
            }
            self.manager_directory.read_key(&key.0, |server_bcard| {
                if let Some(server_bcard) = server_bcard {
                    let better = match &best {
                        None => true,
                        Some((_, _, current)) => table_bcard.timestamp.supersedes(current),
                    };
                    if better {
                        best = Some((
                            key.0,
                            server_bcard.set_config.clone(),
                            table_bcard.timestamp,
                        ));
                    }
                }
            });
        });
        let Some((peer, addr, _)) = best else {
            return Ok(MutationOutcome::Failure);
        };

        let watcher = self.manager.disconnect_watcher(peer);
        let (reply, reply_to) = self.manager.mailbox::<Option<StateTimestamp>>();
        self.manager.send(
            &addr,
            SetConfigRequest {
                table,
                config: new_config.clone(),
                reply_to,
            },
        );

        if interruptor.is_pulsed() {
            return Err(Interrupted);
        }
        let reply_rx = reply.receiver().clone();
        let disconnect_rx = watcher.watch();
        let interrupt_rx = interruptor.watch();
        let committed = crossbeam::select! {
            recv(reply_rx) -> msg => match msg {
                Ok(timestamp) => timestamp,
                Err(_) => return Ok(MutationOutcome::Maybe),
            },
            recv(disconnect_rx) -> _ => return Ok(MutationOutcome::Maybe),
            recv(interrupt_rx) -> _ => return Err(Interrupted),
        };
        // The leader reports failure to apply by replying without a
        // timestamp.
        let Some(committed) = committed else {
            return Ok(MutationOutcome::Maybe);
        };

        // The change is definitely applied; wait until it shows in the
        // directory. Matching on the new name alone would misfire if the
        // table is renamed again in quick succession, so a strictly newer
        // timestamp also satisfies the wait.
        match self.tables.run_key_until_satisfied(
            &table,
            |meta| match meta {
                None => true,
                Some(meta) => {
                    meta.timestamp.supersedes(&committed)
                        || (meta.name == new_config.name && meta.database == new_config.database)
                }
            },
            interruptor,
            Some(self.mutation_wait),
        ) {
            Ok(()) | Err(WaitError::TimedOut) => Ok(MutationOutcome::Success),
            Err(WaitError::Interrupted) => Err(Interrupted),
        }
    }

    /// Manager business cards for the given servers, keyed by server id.
    fn bcards_for_servers(&self, servers: &BTreeSet<ServerId>) -> BTreeMap<ServerId, ManagerBcard> {
        let mut bcards = BTreeMap::new();
        self.manager_directory.read_all(|_, bcard| {
            if servers.contains(&bcard.server_id) {
                bcards.insert(bcard.server_id, bcard.clone());
            }
        });
        bcards
    }

    /// Send an action to every business card and count acks. Each sub-task
    /// waits under its own disconnect watcher; interruption aborts the
    /// sub-task without escaping, so the remaining peers still finish, and
    /// the caller re-checks the interruptor after the join.
    fn fan_out_action(
        &self,
        bcards: &BTreeMap<ServerId, ManagerBcard>,
        interruptor: &Signal,
        make_action: impl Fn(&ServerId, &ManagerBcard, Address<()>) -> TableAction + Sync,
    ) -> usize {
        let num_acked = AtomicUsize::new(0);
        let num_acked_ref = &num_acked;
        let make_action_ref = &make_action;
        thread::scope(|scope| {
            for (server, bcard) in bcards {
                scope.spawn(move || {
                    let watcher = self.manager.disconnect_watcher(bcard.action.peer());
                    let (ack, ack_to) = self.manager.mailbox::<()>();
                    self.manager
                        .send(&bcard.action, make_action_ref(server, bcard, ack_to));
                    let ack_rx = ack.receiver().clone();
                    let disconnect_rx = watcher.watch();
                    let interrupt_rx = interruptor.watch();
                    crossbeam::select! {
                        recv(ack_rx) -> msg => {
                            if msg.is_ok() {
                                num_acked_ref.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        recv(disconnect_rx) -> _ => {}
                        recv(interrupt_rx) -> _ => {}
                    }
                });
            }
        });
        num_acked.into_inner()
    }
}

/// Fold one `(peer, table)` directory delta into the per-table reduction.
fn apply_directory_delta(
    tables: &WatchableMap<TableId, TableMeta>,
    key: &TableKey,
    value: Option<&TableBcard>,
) {
    let (peer, table) = *key;
    match value {
        Some(bcard) => tables.update(&table, |meta| match meta {
            None => Some(TableMeta {
                witnesses: BTreeSet::from([peer]),
                database: bcard.database.clone(),
                name: bcard.name.clone(),
                primary_key: bcard.primary_key.clone(),
                timestamp: bcard.timestamp,
            }),
            Some(mut meta) => {
                meta.witnesses.insert(peer);
                if bcard.timestamp.supersedes(&meta.timestamp) {
                    // primary_key never changes after creation and is left
                    // alone here.
                    meta.database = bcard.database.clone();
                    meta.name = bcard.name.clone();
                    meta.timestamp = bcard.timestamp;
                }
                Some(meta)
            }
        }),
        None => tables.update(&table, |meta| {
            let mut meta = meta?;
            meta.witnesses.remove(&peer);
            if meta.witnesses.is_empty() {
                None
            } else {
                Some(meta)
            }
        }),
    }
}
