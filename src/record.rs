// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The durable side of the protocol: the per-service
 * [`ReconfigurationRecord`] and the [`RecordRequest`]s that mutate it.
 *
 * Records are owned by an external, consensus-replicated store (see
 * [`RecordStore`](crate::RecordStore)); this crate only reads them (to
 * detect obviation) and writes them through the store's narrow `commit`
 * call. The record is the *only* durable progress marker of a
 * reconfiguration: every in-memory task must be re-derivable from it after
 * a crash, which is why [`ReconfigurationRecord::apply`] is a pure
 * transition function the store (or a test double) can replay.
 */
use crate::message::StartEpoch;
use crate::{Group, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a record. `Ready` is the only quiescent state; the others
/// name which phase of an epoch change is in flight, so that a recovering
/// node knows which wait-task to rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Ready,
    WaitAckStop,
    WaitAckStart,
    WaitDelete,
}

/// Durable, consensus-replicated per-service record: the current epoch, its
/// group, and the in-flight next group while a reconfiguration is under way.
///
/// Invariant: `epoch` only increases, and it increases exactly when a
/// `Complete` request commits. While a reconfiguration is in flight the
/// record still carries the *old* epoch; tasks use that to tell "still in
/// progress" from "already superseded".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconfigurationRecord<N: NodeId> {
    pub service_name: String,
    pub epoch: u64,
    pub state: RecordState,
    pub actives: Group<N>,
    pub new_actives: Group<N>,
    /// Whether the previous epoch's retained final state has been dropped.
    pub prev_dropped: bool,
    /// The command that opened the in-flight transition, retained so a
    /// recovering node rebuilds it verbatim (initial state, creator
    /// return-address, merge/split flags). `None` while `Ready`.
    pub pending: Option<StartEpoch<N>>,
}

impl<N: NodeId> ReconfigurationRecord<N> {
    /// A quiescent record at `epoch` hosted by `actives`.
    pub fn new(service_name: &str, epoch: u64, actives: Group<N>) -> Self {
        ReconfigurationRecord {
            service_name: service_name.to_string(),
            epoch,
            state: RecordState::Ready,
            actives,
            new_actives: Group::new(),
            prev_dropped: true,
            pending: None,
        }
    }

    /// A freshly created record: creation epoch in flight, no group ready
    /// yet. Inserted by the store when a creation intent commits.
    pub fn create(se: &StartEpoch<N>) -> Self {
        ReconfigurationRecord {
            service_name: se.service_name.clone(),
            epoch: 0,
            state: RecordState::WaitAckStop,
            actives: Group::new(),
            new_actives: se.cur_group.clone(),
            prev_dropped: true,
            pending: Some(se.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == RecordState::Ready
    }

    /// A deleted record whose stopped group has dropped its retained state
    /// has nothing left to say; the store removes it, freeing the name.
    pub fn is_deletable(&self) -> bool {
        self.state == RecordState::WaitDelete && self.prev_dropped
    }

    /// Apply one committed request, returning whether it took effect. A
    /// request that does not take effect (stale epoch, wrong state) leaves
    /// the record untouched — this is what makes concurrent initiators
    /// safe: exactly one `Complete` per epoch wins, later duplicates are
    /// no-ops.
    pub fn apply(&mut self, req: &RecordRequest<N>) -> bool {
        let se = &req.start_epoch;
        match req.kind {
            RequestKind::Intent => {
                if self.state == RecordState::Ready && se.epoch == self.epoch + 1 {
                    self.new_actives = se.cur_group.clone();
                    self.state = RecordState::WaitAckStop;
                    self.pending = Some(se.clone());
                    true
                } else {
                    false
                }
            }
            RequestKind::Complete => {
                let next = se.epoch == self.epoch + 1;
                let creation = se.is_init_epoch() && se.epoch == self.epoch;
                if self.state != RecordState::Ready && (next || creation) {
                    self.epoch = se.epoch;
                    self.actives = se.cur_group.clone();
                    self.new_actives = Group::new();
                    self.state = RecordState::Ready;
                    // creation has no previous epoch to drop
                    self.prev_dropped = se.is_init_epoch();
                    self.pending = None;
                    true
                } else {
                    false
                }
            }
            RequestKind::Delete => {
                if self.state != RecordState::Ready && se.epoch == self.epoch + 1 {
                    self.state = RecordState::WaitDelete;
                    self.new_actives = Group::new();
                    self.pending = Some(se.clone());
                    // pending until the stopped group drops its state
                    self.prev_dropped = false;
                    true
                } else {
                    false
                }
            }
            RequestKind::Merge => {
                // The fold itself happens at the application coordinator;
                // record-wise a merge is only valid against the epoch it
                // targeted.
                se.epoch == self.epoch + 1
            }
            RequestKind::PrevDropComplete => {
                // A deleted record sits at the old epoch; the drop marker
                // names the (never-started) deletion epoch.
                let target = if self.state == RecordState::WaitDelete {
                    self.epoch + 1
                } else {
                    self.epoch
                };
                if se.epoch == target && !self.prev_dropped {
                    self.prev_dropped = true;
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl<N: NodeId> fmt::Display for ReconfigurationRecord<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:?}",
            self.service_name, self.epoch, self.state
        )
    }
}

/// What a [`RecordRequest`] asks the durable store to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Begin a reconfiguration: pin down the next group.
    Intent,
    /// The new epoch has a majority of started replicas: flip to `Ready`.
    Complete,
    /// The service is being deleted; no next epoch will start.
    Delete,
    /// Fold a mergee's final state into the target's next epoch.
    Merge,
    /// The previous epoch's retained state has been garbage-collected.
    PrevDropComplete,
}

/// The only mutator of [`ReconfigurationRecord`], committed through the
/// external consensus interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest<N: NodeId> {
    pub initiator: N,
    pub start_epoch: StartEpoch<N>,
    pub kind: RequestKind,
}

impl<N: NodeId> RecordRequest<N> {
    pub fn new(initiator: N, start_epoch: StartEpoch<N>, kind: RequestKind) -> Self {
        RecordRequest {
            initiator,
            start_epoch,
            kind,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.start_epoch.service_name
    }
}

impl<N: NodeId> fmt::Display for RecordRequest<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.start_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Rec = ReconfigurationRecord<String>;

    fn group(names: &[&str]) -> Group<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn se(epoch: u64, cur: &[&str], prev: &[&str]) -> StartEpoch<String> {
        StartEpoch::new("i".to_string(), "svc", epoch, group(cur), group(prev))
    }

    fn req(epoch: u64, cur: &[&str], prev: &[&str], kind: RequestKind) -> RecordRequest<String> {
        RecordRequest::new("i".to_string(), se(epoch, cur, prev), kind)
    }

    #[test]
    fn intent_then_complete_bumps_epoch_once() {
        let mut r = Rec::new("svc", 4, group(&["a", "b", "c"]));
        assert!(r.apply(&req(5, &["c", "d", "e"], &["a", "b", "c"], RequestKind::Intent)));
        assert_eq!(r.epoch, 4);
        assert_eq!(r.state, RecordState::WaitAckStop);
        assert!(r.apply(&req(5, &["c", "d", "e"], &["a", "b", "c"], RequestKind::Complete)));
        assert_eq!(r.epoch, 5);
        assert!(r.is_ready());
        assert_eq!(r.actives, group(&["c", "d", "e"]));
    }

    #[test]
    fn epoch_is_monotonic_under_stale_requests() {
        let mut r = Rec::new("svc", 7, group(&["a", "b"]));
        // stale complete for an older epoch must not move the record
        assert!(!r.apply(&req(5, &["x"], &["a", "b"], RequestKind::Complete)));
        assert_eq!(r.epoch, 7);
        // a second intent while transitioning is rejected
        assert!(r.apply(&req(8, &["b", "c"], &["a", "b"], RequestKind::Intent)));
        assert!(!r.apply(&req(8, &["c", "d"], &["a", "b"], RequestKind::Intent)));
        assert!(r.apply(&req(8, &["b", "c"], &["a", "b"], RequestKind::Complete)));
        // duplicate complete is a no-op
        assert!(!r.apply(&req(8, &["b", "c"], &["a", "b"], RequestKind::Complete)));
        assert_eq!(r.epoch, 8);
    }

    #[test]
    fn creation_completes_at_epoch_zero() {
        let mut r = Rec::create(&se(0, &["x", "y", "z"], &[]));
        assert_eq!(r.epoch, 0);
        assert!(!r.is_ready());
        assert!(r.apply(&req(0, &["x", "y", "z"], &[], RequestKind::Complete)));
        assert!(r.is_ready());
        assert_eq!(r.epoch, 0);
        assert!(r.prev_dropped);
    }

    #[test]
    fn in_flight_command_rides_the_record() {
        let cmd = se(1, &["a", "b"], &["x"])
            .with_creator("client".to_string())
            .with_initial_state("S0".to_string());
        let mut r = Rec::new("svc", 0, group(&["x"]));
        assert!(r.apply(&RecordRequest::new("i".to_string(), cmd.clone(), RequestKind::Intent)));
        // A recovering node gets back exactly what the initiator committed.
        assert_eq!(r.pending.as_ref(), Some(&cmd));
        assert!(r.apply(&req(1, &["a", "b"], &["x"], RequestKind::Complete)));
        assert!(r.pending.is_none());
    }

    #[test]
    fn delete_marks_wait_delete_and_drop_makes_it_deletable() {
        let mut r = Rec::new("svc", 3, group(&["a", "b", "c"]));
        assert!(r.apply(&req(4, &[], &["a", "b", "c"], RequestKind::Intent)));
        assert!(r.apply(&req(4, &[], &["a", "b", "c"], RequestKind::Delete)));
        assert_eq!(r.state, RecordState::WaitDelete);
        assert!(!r.is_deletable());
        assert!(r.apply(&req(4, &[], &["a", "b", "c"], RequestKind::PrevDropComplete)));
        assert!(r.is_deletable());
    }

    #[test]
    fn prev_drop_complete_records_gc() {
        let mut r = Rec::new("svc", 4, group(&["a"]));
        r.prev_dropped = false;
        assert!(r.apply(&req(4, &["a"], &["z"], RequestKind::PrevDropComplete)));
        assert!(r.prev_dropped);
        assert!(!r.apply(&req(4, &["a"], &["z"], RequestKind::PrevDropComplete)));
    }
}
