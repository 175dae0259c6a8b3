// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

type Peer = String;
type SharedRecords = Rc<RefCell<BTreeMap<String, ReconfigurationRecord<Peer>>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn group(names: &[&str]) -> Group<Peer> {
    names.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone, Debug)]
struct Replica {
    epoch: u64,
    state: String,
    stopped: bool,
}

/// Per-node environment. Reconfigurator nodes share one record map
/// through `records`, standing in for the consensus replication of the
/// record store; active replicas get a private (unused) one.
struct TestEnv {
    records: SharedRecords,
    replicas: BTreeMap<String, Replica>,
    finals: BTreeMap<(String, u64), String>,
    rcs: Group<Peer>,
    placements: BTreeMap<String, Group<Peer>>,
    suggestions: BTreeMap<String, Group<Peer>>,
    fail_commits: u32,
    merges: Vec<RecordRequest<Peer>>,
}

impl TestEnv {
    fn new(records: SharedRecords, rcs: Group<Peer>) -> Self {
        TestEnv {
            records,
            replicas: BTreeMap::new(),
            finals: BTreeMap::new(),
            rcs,
            placements: BTreeMap::new(),
            suggestions: BTreeMap::new(),
            fail_commits: 0,
            merges: Vec::new(),
        }
    }
}

impl RecordStore<Peer> for TestEnv {
    fn record(&self, service_name: &str) -> Option<ReconfigurationRecord<Peer>> {
        self.records.borrow().get(service_name).cloned()
    }

    fn commit(&mut self, req: &RecordRequest<Peer>) -> bool {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return false;
        }
        let mut records = self.records.borrow_mut();
        let applied = match records.get_mut(req.service_name()) {
            Some(r) => r.apply(req),
            None => {
                if req.kind == RequestKind::Intent && req.start_epoch.is_init_epoch() {
                    records.insert(
                        req.service_name().to_string(),
                        ReconfigurationRecord::create(&req.start_epoch),
                    );
                    true
                } else {
                    false
                }
            }
        };
        if applied && req.kind == RequestKind::Merge {
            self.merges.push(req.clone());
        }
        if applied
            && records
                .get(req.service_name())
                .map_or(false, |r| r.is_deletable())
        {
            records.remove(req.service_name());
        }
        applied
    }

    fn records(&self) -> Vec<ReconfigurationRecord<Peer>> {
        self.records.borrow().values().cloned().collect()
    }
}

impl AppCoordinator<Peer> for TestEnv {
    fn current_epoch(&self, service_name: &str) -> Option<u64> {
        self.replicas.get(service_name).map(|r| r.epoch)
    }

    fn create_replica_group(
        &mut self,
        service_name: &str,
        epoch: u64,
        state: Option<&str>,
        _group: &Group<Peer>,
    ) -> bool {
        match self.replicas.get(service_name) {
            Some(r) if r.epoch > epoch => false,
            Some(r) if r.epoch == epoch => true,
            _ => {
                self.replicas.insert(
                    service_name.to_string(),
                    Replica {
                        epoch,
                        state: state.unwrap_or_default().to_string(),
                        stopped: false,
                    },
                );
                true
            }
        }
    }

    fn stop_replica_group(&mut self, service_name: &str, epoch: u64) -> bool {
        match self.replicas.get_mut(service_name) {
            Some(r) if r.epoch == epoch => {
                r.stopped = true;
                true
            }
            _ => false,
        }
    }

    fn checkpoint(&mut self, service_name: &str, epoch: u64) -> bool {
        match self.replicas.get(service_name) {
            Some(r) if r.epoch == epoch && r.stopped => {
                self.finals
                    .insert((service_name.to_string(), epoch), r.state.clone());
                true
            }
            _ => false,
        }
    }

    fn final_state(&self, service_name: &str, epoch: u64) -> Option<String> {
        self.finals.get(&(service_name.to_string(), epoch)).cloned()
    }

    fn delete_final_state(&mut self, service_name: &str, epoch: u64) {
        self.finals.remove(&(service_name.to_string(), epoch));
    }
}

impl Env<Peer> for TestEnv {
    fn reconfigurators(&self) -> Group<Peer> {
        self.rcs.clone()
    }

    fn placement(&self, service_name: &str) -> Group<Peer> {
        self.placements
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    fn suggest_group(&mut self, service_name: &str, _demand: u64) -> Option<Group<Peer>> {
        self.suggestions.get(service_name).cloned()
    }
}

/// Synchronous in-memory network: three reconfigurators r1..r3, five
/// active replicas a..e. Messages to anyone else (clients) land in
/// `client_inbox`.
struct Network {
    nodes: BTreeMap<Peer, Executor<Peer, TestEnv>>,
    client_inbox: Vec<Envelope<Peer>>,
    now_secs: u64,
}

const RCS: &[&str] = &["r1", "r2", "r3"];
const ACTIVES: &[&str] = &["a", "b", "c", "d", "e"];

impl Network {
    fn new() -> (Network, SharedRecords) {
        init_tracing();
        let records: SharedRecords = Rc::new(RefCell::new(BTreeMap::new()));
        let rcs = group(RCS);
        let mut nodes = BTreeMap::new();
        for r in RCS {
            let id = r.to_string();
            let env = TestEnv::new(records.clone(), rcs.clone());
            nodes.insert(
                id.clone(),
                Executor::new(id.clone(), env, Box::new(Reconfigurator::new(id))),
            );
        }
        for a in ACTIVES {
            let id = a.to_string();
            let env = TestEnv::new(Rc::new(RefCell::new(BTreeMap::new())), rcs.clone());
            nodes.insert(
                id.clone(),
                Executor::new(id.clone(), env, Box::new(ActiveReplica::new(id))),
            );
        }
        (
            Network {
                nodes,
                client_inbox: Vec::new(),
                now_secs: 0,
            },
            records,
        )
    }

    fn env_mut(&mut self, node: &str) -> &mut TestEnv {
        self.nodes.get_mut(node).unwrap().env_mut()
    }

    /// Host a replica of `service` at `epoch` with `state` on each of
    /// `on`, and seed the matching quiescent record.
    fn seed_service(
        &mut self,
        records: &SharedRecords,
        service: &str,
        epoch: u64,
        state: &str,
        on: &[&str],
    ) {
        records.borrow_mut().insert(
            service.to_string(),
            ReconfigurationRecord::new(service, epoch, group(on)),
        );
        for node in on {
            self.env_mut(*node).replicas.insert(
                service.to_string(),
                Replica {
                    epoch,
                    state: state.to_string(),
                    stopped: false,
                },
            );
        }
    }

    /// Deliver drained traffic until no node has anything left to send.
    fn deliver(&mut self) {
        loop {
            let mut pending: Vec<Outgoing<Peer>> = Vec::new();
            for node in self.nodes.values_mut() {
                pending.append(&mut node.drain_outbox());
            }
            if pending.is_empty() {
                return;
            }
            for out in pending {
                for dest in out.to.iter() {
                    match self.nodes.get_mut(dest) {
                        Some(n) => n.receive(out.envelope.clone()),
                        None => self.client_inbox.push(out.envelope.clone()),
                    }
                }
            }
        }
    }

    fn send(&mut self, to: &str, sender: &str, body: Packet<Peer>) {
        let envelope = Envelope {
            key: None,
            sender: sender.to_string(),
            body,
        };
        self.nodes.get_mut(to).unwrap().receive(envelope);
        self.deliver();
    }

    /// Advance every node's clock one second at a time, delivering after
    /// each step.
    fn run(&mut self, rounds: u64) {
        for _ in 0..rounds {
            self.now_secs += 1;
            let now = Duration::from_secs(self.now_secs);
            for node in self.nodes.values_mut() {
                node.tick(now);
            }
            self.deliver();
        }
    }

    fn task_count(&self) -> usize {
        self.nodes.values().map(|n| n.task_count()).sum()
    }
}

fn record_of(records: &SharedRecords, name: &str) -> ReconfigurationRecord<Peer> {
    records.borrow().get(name).cloned().unwrap()
}

#[test]
fn create_service_end_to_end() {
    let (mut net, records) = Network::new();
    net.env_mut("r1")
        .placements
        .insert("beta".to_string(), group(&["a", "b", "c"]));

    net.send(
        "r1",
        "cl",
        Packet::CreateServiceName(CreateServiceName {
            service_name: "beta".to_string(),
            initial_state: Some("S0".to_string()),
            creator: "cl".to_string(),
        }),
    );
    net.run(2);

    let r = record_of(&records, "beta");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 0);
    assert_eq!(r.actives, group(&["a", "b", "c"]));
    for node in &["a", "b", "c"] {
        let replica = net.env_mut(*node).replicas.get("beta").cloned().unwrap();
        assert_eq!(replica.epoch, 0);
        assert_eq!(replica.state, "S0");
    }
    assert!(net.client_inbox.iter().any(|e| matches!(
        &e.body,
        Packet::CreateConfirmation(c) if c.service_name == "beta" && c.epoch == 0
    )));
}

#[test]
fn recreate_existing_service_reconfirms() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "beta", 2, "S", &["a", "b"]);

    net.send(
        "r1",
        "cl",
        Packet::CreateServiceName(CreateServiceName {
            service_name: "beta".to_string(),
            initial_state: None,
            creator: "cl".to_string(),
        }),
    );

    assert_eq!(record_of(&records, "beta").epoch, 2);
    assert!(net.client_inbox.iter().any(|e| matches!(
        &e.body,
        Packet::CreateConfirmation(c) if c.service_name == "beta" && c.epoch == 2
    )));
}

#[test]
fn migrate_epoch_with_state_transfer() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);
    net.env_mut("r1")
        .suggestions
        .insert("alpha".to_string(), group(&["c", "d", "e"]));

    net.send(
        "r1",
        "a",
        Packet::DemandReport(DemandReport {
            service_name: "alpha".to_string(),
            demand: 9000,
        }),
    );
    net.run(4);

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["c", "d", "e"]));
    assert!(r.prev_dropped);
    // every new-group member installed the old epoch's final state
    for node in &["c", "d", "e"] {
        let replica = net.env_mut(*node).replicas.get("alpha").cloned().unwrap();
        assert_eq!(replica.epoch, 5);
        assert_eq!(replica.state, "S4");
    }
    // the stopped member's retained state was garbage-collected
    assert!(net
        .env_mut("a")
        .finals
        .get(&("alpha".to_string(), 4))
        .is_none());
    // everything wound down, including the backups at r2/r3
    net.run(8);
    assert_eq!(net.task_count(), 0);
}

#[test]
fn delete_service_frees_the_name() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "gamma", 2, "G", &["a", "b"]);

    net.send(
        "r1",
        "cl",
        Packet::DeleteServiceName(DeleteServiceName {
            service_name: "gamma".to_string(),
        }),
    );
    net.run(3);

    // Once the stopped group drops its retained state, the record itself
    // is gone; nothing remembers the deleted service.
    assert!(records.borrow().get("gamma").is_none());
    for node in &["a", "b"] {
        assert!(net
            .env_mut(*node)
            .finals
            .get(&("gamma".to_string(), 2))
            .is_none());
    }

    // The name is reusable: a fresh creation starts over at epoch 0.
    net.env_mut("r1")
        .placements
        .insert("gamma".to_string(), group(&["d", "e"]));
    net.send(
        "r1",
        "cl",
        Packet::CreateServiceName(CreateServiceName {
            service_name: "gamma".to_string(),
            initial_state: Some("G2".to_string()),
            creator: "cl".to_string(),
        }),
    );
    net.run(2);

    let r = record_of(&records, "gamma");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 0);
    assert_eq!(r.actives, group(&["d", "e"]));
    assert_eq!(
        net.env_mut("d").replicas.get("gamma").cloned().unwrap().state,
        "G2"
    );
}

#[test]
fn deferred_commit_retries_then_drives_stop_phase() {
    let (mut net, records) = Network::new();
    net.env_mut("r1")
        .placements
        .insert("beta".to_string(), group(&["a", "b", "c"]));
    // r1's first commit attempt fails; the relayed intent commits at a
    // peer, and r1's CommitWait must pick the change back up from the
    // record.
    net.env_mut("r1").fail_commits = 1;

    net.send(
        "r1",
        "cl",
        Packet::CreateServiceName(CreateServiceName {
            service_name: "beta".to_string(),
            initial_state: Some("S0".to_string()),
            creator: "cl".to_string(),
        }),
    );
    assert!(!record_of(&records, "beta").is_ready());

    net.run(3);
    let r = record_of(&records, "beta");
    assert!(r.is_ready());
    assert_eq!(r.actives, group(&["a", "b", "c"]));
}

#[test]
fn backup_takes_over_from_crashed_initiator() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);

    // Simulate r1 initiating and crashing: its intent is committed and
    // relayed, but r1 itself never runs the stop phase.
    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["c", "d", "e"]),
        group(&["a", "b", "c"]),
    );
    let req = RecordRequest::new("r1".to_string(), se, RequestKind::Intent);
    assert!(records
        .borrow_mut()
        .get_mut("alpha")
        .unwrap()
        .apply(&req));
    net.send("r2", "r1", Packet::RcRecordRequest(req));

    // r2 shadows the change and stays passive through the grace period.
    assert_eq!(net.nodes.get("r2").unwrap().task_count(), 1);
    assert!(!record_of(&records, "alpha").is_ready());

    net.run(10);
    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["c", "d", "e"]));
}

#[test]
fn backup_short_circuits_on_observed_start_ack() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);

    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["c", "d", "e"]),
        group(&["a", "b", "c"]),
    );
    let req = RecordRequest::new("r1".to_string(), se, RequestKind::Intent);
    assert!(records.borrow_mut().get_mut("alpha").unwrap().apply(&req));
    net.send("r2", "r1", Packet::RcRecordRequest(req));
    assert_eq!(net.nodes.get("r2").unwrap().task_count(), 1);

    // An ack addressed to the (dead) initiator's task proves the start
    // phase happened; the backup completes the record without re-running
    // anything.
    net.send(
        "r2",
        "c",
        Packet::AckStartEpoch(AckStartEpoch {
            service_name: "alpha".to_string(),
            epoch: 5,
        }),
    );

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(net.nodes.get("r2").unwrap().task_count(), 0);
}

#[test]
fn lookup_active_replicas() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);

    net.send(
        "r1",
        "cl",
        Packet::RequestActiveReplicas(RequestActiveReplicas {
            service_name: "alpha".to_string(),
        }),
    );

    assert!(net.client_inbox.iter().any(|e| matches!(
        &e.body,
        Packet::ActiveReplicas(a)
            if a.service_name == "alpha" && a.epoch == 4 && a.group == group(&["a", "b", "c"])
    )));
    // unknown names are dropped, not answered
    net.client_inbox.clear();
    net.send(
        "r1",
        "cl",
        Packet::RequestActiveReplicas(RequestActiveReplicas {
            service_name: "nope".to_string(),
        }),
    );
    assert!(net.client_inbox.is_empty());
}

#[test]
fn recovery_rebuilds_and_finishes_inflight_change() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);

    // Crash mid-change: the record shows a committed intent and nothing
    // else survives.
    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["c", "d", "e"]),
        group(&["a", "b", "c"]),
    );
    let req = RecordRequest::new("r1".to_string(), se, RequestKind::Intent);
    assert!(records.borrow_mut().get_mut("alpha").unwrap().apply(&req));

    let rc = Reconfigurator::new("r1".to_string());
    let tasks = rc.recover(net.nodes.get("r1").unwrap().env());
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].key().starts_with("StopEpochWait"));
    for t in tasks {
        net.nodes.get_mut("r1").unwrap().spawn_if_not_running(t);
    }
    net.deliver();
    net.run(8);

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    for node in &["c", "d", "e"] {
        assert_eq!(
            net.env_mut(*node)
                .replicas
                .get("alpha")
                .cloned()
                .unwrap()
                .state,
            "S4"
        );
    }
}

#[test]
fn duplicate_demand_reports_cause_one_reconfiguration() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);
    net.env_mut("r1")
        .suggestions
        .insert("alpha".to_string(), group(&["c", "d", "e"]));

    let report = Packet::DemandReport(DemandReport {
        service_name: "alpha".to_string(),
        demand: 9000,
    });
    net.send("r1", "a", report.clone());
    // a second report while the change is in flight (or after it lands
    // on the suggested group) must not start epoch 6
    net.send("r1", "b", report);
    net.run(6);

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["c", "d", "e"]));
}

#[test]
fn stop_probe_rotates_past_dead_member() {
    let (mut net, records) = Network::new();
    // "z" is in the previous group but does not exist on the network, so
    // the first stop probe (lowest id "a"... here "x") may be lost; the
    // waiter must rotate to a live member on restart.
    net.seed_service(&records, "alpha", 4, "S4", &["b", "c"]);
    records.borrow_mut().insert(
        "alpha".to_string(),
        ReconfigurationRecord::new("alpha", 4, group(&["a0", "b", "c"])),
    );
    net.env_mut("r1")
        .suggestions
        .insert("alpha".to_string(), group(&["d", "e"]));

    net.send(
        "r1",
        "b",
        Packet::DemandReport(DemandReport {
            service_name: "alpha".to_string(),
            demand: 1,
        }),
    );
    // first probe goes to "a0", which is not a node; ticks rotate the
    // cursor to "b"
    net.run(6);

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["d", "e"]));
}

#[test]
fn stale_stop_wait_cancels_itself() {
    init_tracing();
    let (mut net, records) = Network::new();
    // The record already shows epoch 5 ready, so a leftover waiter for
    // the 4 -> 5 change has nothing left to do and must retire on its
    // first restart rather than keep probing.
    net.seed_service(&records, "alpha", 5, "S5", &["d", "e"]);

    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["d", "e"]),
        group(&["b", "c"]),
    );
    let task = StopEpochWait::new("r1".to_string(), se).unwrap();
    assert!(net
        .nodes
        .get_mut("r1")
        .unwrap()
        .spawn_if_not_running(Box::new(task)));
    assert_eq!(net.nodes.get("r1").unwrap().task_count(), 1);

    net.run(3);

    assert_eq!(net.task_count(), 0);
    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
}

#[test]
fn recovery_preserves_creation_initial_state() {
    let (mut net, records) = Network::new();
    // A creation intent (with the client's initial state) commits, then
    // the initiator crashes before driving the start phase. Everything
    // needed to finish the creation must come back from the record.
    let se = StartEpoch::new(
        "r1".to_string(),
        "delta",
        0,
        group(&["a", "b", "c"]),
        Group::new(),
    )
    .with_creator("cl".to_string())
    .with_initial_state("D0".to_string());
    let req = RecordRequest::new("r1".to_string(), se, RequestKind::Intent);
    assert!(net.env_mut("r1").commit(&req));

    let rc = Reconfigurator::new("r1".to_string());
    let tasks = rc.recover(net.nodes.get("r1").unwrap().env());
    assert_eq!(tasks.len(), 1);
    for t in tasks {
        net.nodes.get_mut("r1").unwrap().spawn_if_not_running(t);
    }
    net.deliver();
    net.run(4);

    let r = record_of(&records, "delta");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 0);
    for node in &["a", "b", "c"] {
        let replica = net.env_mut(*node).replicas.get("delta").cloned().unwrap();
        assert_eq!(replica.state, "D0");
    }
    // the recovered command still knows who asked
    assert!(net.client_inbox.iter().any(|e| matches!(
        &e.body,
        Packet::CreateConfirmation(c) if c.service_name == "delta" && c.epoch == 0
    )));
}

#[test]
fn merge_folds_mergee_final_state() {
    let (mut net, records) = Network::new();
    // "small" is dissolving into "big": big's next epoch stops small and
    // folds small's final state into the record request it commits.
    net.seed_service(&records, "big", 4, "B4", &["c", "d", "e"]);
    net.seed_service(&records, "small", 2, "SM2", &["a", "b"]);

    let se = StartEpoch::new(
        "r1".to_string(),
        "big",
        5,
        group(&["c", "d", "e"]),
        group(&["a", "b"]),
    )
    .merged_from("small", 2);
    let task = StopEpochWait::new("r1".to_string(), se).unwrap();
    assert!(net
        .nodes
        .get_mut("r1")
        .unwrap()
        .spawn_if_not_running(Box::new(task)));
    net.deliver();
    net.run(2);

    // the mergee was stopped and its state travelled in the merge commit
    assert!(net.env_mut("a").replicas.get("small").unwrap().stopped);
    let merges = &net.env_mut("r1").merges;
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].kind, RequestKind::Merge);
    assert_eq!(merges[0].start_epoch.initial_state.as_deref(), Some("SM2"));
    // record-wise a merge leaves the target's record where it was
    let r = record_of(&records, "big");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 4);

    net.run(2);
    assert_eq!(net.task_count(), 0);
}

#[test]
fn split_epoch_self_acks_without_stopping_the_parent() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["a", "b", "c"]);

    // One half of a split: the old group keeps running (it is stopped by
    // its own reconfiguration), so the stop phase must not touch it.
    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["d", "e"]),
        group(&["a", "b", "c"]),
    )
    .split();
    let req = RecordRequest::new("r1".to_string(), se.clone(), RequestKind::Intent);
    assert!(records.borrow_mut().get_mut("alpha").unwrap().apply(&req));
    let task = StopEpochWait::new("r1".to_string(), se).unwrap();
    assert!(net
        .nodes
        .get_mut("r1")
        .unwrap()
        .spawn_if_not_running(Box::new(task)));
    net.deliver();
    net.run(3);

    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["d", "e"]));
    // the parent group was never probed, let alone stopped
    for node in &["a", "b", "c"] {
        let replica = net.env_mut(*node).replicas.get("alpha").cloned().unwrap();
        assert!(!replica.stopped);
        assert_eq!(replica.epoch, 4);
    }
}

#[test]
fn takeover_probes_the_preferred_member_first() {
    let (mut net, records) = Network::new();
    net.seed_service(&records, "alpha", 4, "S4", &["b", "c"]);

    let se = StartEpoch::new(
        "r1".to_string(),
        "alpha",
        5,
        group(&["d", "e"]),
        group(&["b", "c"]),
    );
    let req = RecordRequest::new("r1".to_string(), se, RequestKind::Intent);
    assert!(records.borrow_mut().get_mut("alpha").unwrap().apply(&req));
    net.send("r2", "r1", Packet::RcRecordRequest(req));
    assert_eq!(net.nodes.get("r2").unwrap().task_count(), 1);

    net.run(10);

    // One ack suffices, so exactly one previous-group member gets stopped;
    // the takeover must begin at the head of the probe order, not skip it.
    assert!(net.env_mut("b").replicas.get("alpha").unwrap().stopped);
    assert!(!net.env_mut("c").replicas.get("alpha").unwrap().stopped);
    let r = record_of(&records, "alpha");
    assert!(r.is_ready());
    assert_eq!(r.epoch, 5);
    assert_eq!(r.actives, group(&["d", "e"]));
}
