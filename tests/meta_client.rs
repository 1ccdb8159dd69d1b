//! End-to-end exercises for the table metadata client against scripted
//! peers on the in-process transport.

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use shoal::Limits;
use shoal::cluster::{
    Epoch, FindError, GetConfigRequest, Interrupted, Mailbox, MailboxManager, ManagerBcard,
    MutationOutcome, PeerId, ServerId, SetConfigRequest, ShardConfig, Signal, StateTimestamp,
    TableAction, TableBcard, TableConfig, TableId, WatchableMap,
};

fn ts(microtime: u64, log_index: u64) -> StateTimestamp {
    StateTimestamp::new(
        Epoch {
            microtime,
            id: Uuid::nil(),
        },
        log_index,
    )
}

fn config(database: &str, name: &str, replicas: &[ServerId]) -> TableConfig {
    TableConfig {
        database: database.to_string(),
        name: name.to_string(),
        primary_key: "id".to_string(),
        shards: vec![ShardConfig {
            replicas: replicas.to_vec(),
            primary: replicas[0],
        }],
    }
}

fn bcard_for(config: &TableConfig, timestamp: StateTimestamp, is_leader: bool) -> TableBcard {
    TableBcard {
        database: config.database.clone(),
        name: config.name.clone(),
        primary_key: config.primary_key.clone(),
        timestamp,
        is_leader,
    }
}

struct FakeServer {
    peer: PeerId,
    server: ServerId,
    bcard: ManagerBcard,
    actions: Mailbox<TableAction>,
    get_configs: Mailbox<GetConfigRequest>,
    set_configs: Mailbox<SetConfigRequest>,
}

fn fake_server() -> FakeServer {
    let peer = PeerId::fresh();
    let server = ServerId::fresh();
    let (actions, action_addr) = Mailbox::new(peer);
    let (get_configs, get_addr) = Mailbox::new(peer);
    let (set_configs, set_addr) = Mailbox::new(peer);
    FakeServer {
        peer,
        server,
        bcard: ManagerBcard {
            server_id: server,
            get_config: get_addr,
            set_config: set_addr,
            action: action_addr,
        },
        actions,
        get_configs,
        set_configs,
    }
}

struct Cluster {
    manager: MailboxManager,
    manager_directory: WatchableMap<PeerId, ManagerBcard>,
    table_directory: WatchableMap<(PeerId, TableId), TableBcard>,
    client: shoal::cluster::TableMetaClient,
}

fn cluster() -> Cluster {
    let manager = MailboxManager::new(PeerId::fresh());
    let manager_directory: WatchableMap<PeerId, ManagerBcard> = WatchableMap::new();
    let table_directory: WatchableMap<(PeerId, TableId), TableBcard> = WatchableMap::new();
    let limits = Limits {
        mutation_wait_ms: 2_000,
        ..Limits::default()
    };
    let client = shoal::cluster::TableMetaClient::new(
        manager.clone(),
        manager_directory.clone(),
        table_directory.clone(),
        &limits,
    );
    Cluster {
        manager,
        manager_directory,
        table_directory,
        client,
    }
}

impl Cluster {
    fn join_cluster(&self, server: &FakeServer) {
        self.manager_directory.set(server.peer, server.bcard.clone());
    }
}

/// Replica that acknowledges a creation action and advertises the new table.
fn respond_create(cluster: &Cluster, server: FakeServer, is_leader: bool) -> JoinHandle<()> {
    let manager = cluster.manager.clone();
    let table_directory = cluster.table_directory.clone();
    thread::spawn(move || {
        let action = server.actions.receiver().recv().expect("action delivered");
        assert!(!action.is_drop);
        let state = action.raft_state.expect("raft state accompanies creation");
        assert_eq!(
            action.member_id,
            state.snapshot_state.member_ids.get(&server.server).copied(),
        );
        let table_config = state.snapshot_state.config;
        table_directory.set(
            (server.peer, action.table),
            bcard_for(&table_config, action.timestamp, is_leader),
        );
        manager.send(&action.ack_to, ());
    })
}

/// Replica that acknowledges a drop action and withdraws its advertisement.
fn respond_drop(cluster: &Cluster, server: FakeServer, floor: StateTimestamp) -> JoinHandle<()> {
    let manager = cluster.manager.clone();
    let table_directory = cluster.table_directory.clone();
    thread::spawn(move || {
        let action = server.actions.receiver().recv().expect("action delivered");
        assert!(action.is_drop);
        assert!(action.member_id.is_none());
        assert!(action.raft_state.is_none());
        // The synthetic deletion timestamp must dominate whatever the table
        // was advertised at.
        assert!(action.timestamp.supersedes(&floor));
        table_directory.remove(&(server.peer, action.table));
        manager.send(&action.ack_to, ());
    })
}

#[test]
fn create_with_partial_acks_succeeds() {
    let cluster = cluster();
    let s1 = fake_server();
    let s2 = fake_server();
    let s3 = fake_server();
    for server in [&s1, &s2, &s3] {
        cluster.join_cluster(server);
    }
    // One replica is already unreachable when the fan-out starts.
    cluster.manager.disconnect(s3.peer);

    let initial = config("db", "users", &[s1.server, s2.server, s3.server]);
    let h1 = respond_create(&cluster, s1, true);
    let h2 = respond_create(&cluster, s2, false);

    let interruptor = Signal::new();
    let (outcome, table) = cluster.client.create(&initial, &interruptor).unwrap();
    assert_eq!(outcome, MutationOutcome::Success);

    let meta = cluster.client.read_table(table).unwrap();
    assert_eq!(meta.witnesses.len(), 2);
    assert_eq!(meta.database, "db");
    assert_eq!(meta.name, "users");
    assert_eq!(cluster.client.find("db", "users"), Ok(table));

    h1.join().unwrap();
    h2.join().unwrap();
}

#[test]
fn create_with_no_acks_is_maybe() {
    let cluster = cluster();
    let s1 = fake_server();
    let s2 = fake_server();
    cluster.join_cluster(&s1);
    cluster.join_cluster(&s2);
    // Both replicas are gone, but their business cards are still visible:
    // the attempt may or may not have landed.
    cluster.manager.disconnect(s1.peer);
    cluster.manager.disconnect(s2.peer);

    let initial = config("db", "users", &[s1.server, s2.server]);
    let interruptor = Signal::new();
    let (outcome, _table) = cluster.client.create(&initial, &interruptor).unwrap();
    assert_eq!(outcome, MutationOutcome::Maybe);
}

#[test]
fn create_with_no_reachable_replicas_fails() {
    let cluster = cluster();
    // Nothing in the manager directory at all: a definite no-op.
    let replicas = [ServerId::fresh()];
    let initial = config("db", "users", &replicas);
    let interruptor = Signal::new();
    let (outcome, _table) = cluster.client.create(&initial, &interruptor).unwrap();
    assert_eq!(outcome, MutationOutcome::Failure);
}

#[test]
fn create_propagates_interruption() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let initial = config("db", "users", &[s1.server]);
    let interruptor = Signal::new();
    interruptor.pulse();
    let err = cluster.client.create(&initial, &interruptor).unwrap_err();
    assert_eq!(err, Interrupted);
}

#[test]
fn drop_supersedes_a_live_table() {
    let cluster = cluster();
    let s1 = fake_server();
    let s2 = fake_server();
    cluster.join_cluster(&s1);
    cluster.join_cluster(&s2);

    let table = TableId::fresh();
    let advertised = ts(5, 5);
    let table_config = config("db", "users", &[s1.server, s2.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, advertised, true));
    cluster
        .table_directory
        .set((s2.peer, table), bcard_for(&table_config, advertised, false));
    assert_eq!(cluster.client.find("db", "users"), Ok(table));

    let h1 = respond_drop(&cluster, s1, advertised);
    let h2 = respond_drop(&cluster, s2, advertised);

    let interruptor = Signal::new();
    let outcome = cluster.client.drop_table(table, &interruptor).unwrap();
    assert_eq!(outcome, MutationOutcome::Success);

    assert_eq!(cluster.client.read_table(table), None);
    assert_eq!(
        cluster.client.find("db", "users"),
        Err(FindError::NoSuchTable {
            database: "db".to_string(),
            name: "users".to_string(),
        })
    );

    h1.join().unwrap();
    h2.join().unwrap();
}

#[test]
fn drop_of_an_unknown_table_fails() {
    let cluster = cluster();
    let interruptor = Signal::new();
    let outcome = cluster
        .client
        .drop_table(TableId::fresh(), &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Failure);
}

#[test]
fn get_config_asks_the_freshest_host() {
    let cluster = cluster();
    let s1 = fake_server();
    let s2 = fake_server();
    cluster.join_cluster(&s1);
    cluster.join_cluster(&s2);

    let table = TableId::fresh();
    let stale = config("db", "users_v1", &[s1.server]);
    let fresh = config("db", "users_v2", &[s2.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&stale, ts(1, 0), false));
    cluster
        .table_directory
        .set((s2.peer, table), bcard_for(&fresh, ts(2, 0), true));

    let expected = fresh.clone();
    let responder = thread::spawn({
        let manager = cluster.manager.clone();
        move || {
            let request = s2.get_configs.receiver().recv().expect("request delivered");
            let table = request.table.expect("targeted get_config names a table");
            manager.send(&request.reply_to, BTreeMap::from([(table, expected)]));
        }
    });

    let interruptor = Signal::new();
    let result = cluster.client.get_config(table, &interruptor).unwrap();
    assert_eq!(result, Some(fresh));
    // The stale host was never consulted.
    assert!(s1.get_configs.receiver().try_recv().is_err());

    responder.join().unwrap();
}

#[test]
fn get_config_empty_reply_means_no_longer_hosted() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let table = TableId::fresh();
    let table_config = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, ts(1, 0), true));

    let responder = thread::spawn({
        let manager = cluster.manager.clone();
        move || {
            let request = s1.get_configs.receiver().recv().expect("request delivered");
            manager.send(&request.reply_to, BTreeMap::new());
        }
    });

    let interruptor = Signal::new();
    assert_eq!(cluster.client.get_config(table, &interruptor).unwrap(), None);
    responder.join().unwrap();
}

#[test]
fn get_config_with_no_host_returns_none() {
    let cluster = cluster();
    let interruptor = Signal::new();
    assert_eq!(
        cluster
            .client
            .get_config(TableId::fresh(), &interruptor)
            .unwrap(),
        None
    );
}

#[test]
fn get_config_disconnect_before_reply_returns_none() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let table = TableId::fresh();
    let table_config = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, ts(1, 0), true));
    cluster.manager.disconnect(s1.peer);

    let interruptor = Signal::new();
    assert_eq!(cluster.client.get_config(table, &interruptor).unwrap(), None);
}

#[test]
fn list_configs_merges_every_reachable_peer() {
    let cluster = cluster();
    let s1 = fake_server();
    let s2 = fake_server();
    let s3 = fake_server();
    cluster.join_cluster(&s1);
    cluster.join_cluster(&s2);
    cluster.join_cluster(&s3);
    cluster.manager.disconnect(s3.peer);

    let t1 = TableId::fresh();
    let t2 = TableId::fresh();
    let c1 = config("db", "users", &[s1.server]);
    let c2 = config("db", "posts", &[s2.server]);

    let mut responders = Vec::new();
    for (server, table, table_config) in [(s1, t1, c1.clone()), (s2, t2, c2.clone())] {
        responders.push(thread::spawn({
            let manager = cluster.manager.clone();
            move || {
                let request = server
                    .get_configs
                    .receiver()
                    .recv()
                    .expect("request delivered");
                assert!(request.table.is_none());
                manager.send(&request.reply_to, BTreeMap::from([(table, table_config)]));
            }
        }));
    }

    let interruptor = Signal::new();
    let configs = cluster.client.list_configs(&interruptor).unwrap();
    assert_eq!(configs, BTreeMap::from([(t1, c1), (t2, c2)]));

    for responder in responders {
        responder.join().unwrap();
    }
}

#[test]
fn list_configs_raises_interruption_after_the_join() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let interruptor = Signal::new();
    interruptor.pulse();
    let err = cluster.client.list_configs(&interruptor).unwrap_err();
    assert_eq!(err, Interrupted);
}

#[test]
fn set_config_without_a_leader_fails() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let table = TableId::fresh();
    let table_config = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, ts(1, 0), false));

    let interruptor = Signal::new();
    let outcome = cluster
        .client
        .set_config(table, &table_config, &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Failure);
}

#[test]
fn set_config_disconnect_is_maybe() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let table = TableId::fresh();
    let table_config = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, ts(1, 0), true));
    cluster.manager.disconnect(s1.peer);

    let interruptor = Signal::new();
    let outcome = cluster
        .client
        .set_config(table, &table_config, &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Maybe);
}

#[test]
fn set_config_leader_refusal_is_maybe() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);

    let table = TableId::fresh();
    let table_config = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((s1.peer, table), bcard_for(&table_config, ts(1, 0), true));

    let responder = thread::spawn({
        let manager = cluster.manager.clone();
        move || {
            let request = s1.set_configs.receiver().recv().expect("request delivered");
            manager.send(&request.reply_to, None);
        }
    });

    let interruptor = Signal::new();
    let outcome = cluster
        .client
        .set_config(table, &table_config, &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Maybe);
    responder.join().unwrap();
}

#[test]
fn set_config_survives_a_racing_rename() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);
    let leader_peer = s1.peer;

    let table = TableId::fresh();
    let original = config("db", "old_name", &[s1.server]);
    cluster
        .table_directory
        .set((leader_peer, table), bcard_for(&original, ts(1, 0), true));

    let requested = config("db", "mid_name", &[s1.server]);
    let committed = ts(2, 0);
    let raced = ts(3, 0);

    // The leader applies our change, but a second rename lands before the
    // directory ever shows `mid_name`.
    let responder = thread::spawn({
        let manager = cluster.manager.clone();
        let table_directory = cluster.table_directory.clone();
        move || {
            let request = s1.set_configs.receiver().recv().expect("request delivered");
            assert_eq!(request.config.name, "mid_name");
            manager.send(&request.reply_to, Some(committed));
            let mut final_config = request.config;
            final_config.name = "final_name".to_string();
            table_directory.set(
                (leader_peer, request.table),
                bcard_for(&final_config, raced, true),
            );
        }
    });

    let interruptor = Signal::new();
    let started = Instant::now();
    let outcome = cluster
        .client
        .set_config(table, &requested, &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Success);
    // The wait was satisfied by the superseding timestamp, not by waiting
    // out the window hoping for a name match.
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(cluster.client.read_table(table).unwrap().name, "final_name");

    responder.join().unwrap();
}

#[test]
fn set_config_racing_drop_is_success() {
    let cluster = cluster();
    let s1 = fake_server();
    cluster.join_cluster(&s1);
    let leader_peer = s1.peer;

    let table = TableId::fresh();
    let original = config("db", "users", &[s1.server]);
    cluster
        .table_directory
        .set((leader_peer, table), bcard_for(&original, ts(1, 0), true));

    let committed = ts(2, 0);
    let responder = thread::spawn({
        let manager = cluster.manager.clone();
        let table_directory = cluster.table_directory.clone();
        move || {
            let request = s1.set_configs.receiver().recv().expect("request delivered");
            manager.send(&request.reply_to, Some(committed));
            // A drop wins the race: the entry disappears entirely.
            table_directory.remove(&(leader_peer, request.table));
        }
    });

    let interruptor = Signal::new();
    let outcome = cluster
        .client
        .set_config(table, &original, &interruptor)
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Success);
    assert_eq!(cluster.client.read_table(table), None);

    responder.join().unwrap();
}
