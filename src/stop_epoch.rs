// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * First phase of an epoch change: [`StopEpochWait`] quiesces the previous
 * epoch. One acknowledgment suffices (any stopped member can later serve
 * final state), so the task probes previous-group members one at a time,
 * itself first, rather than broadcasting.
 *
 * Two epoch changes have no previous group to stop: creations, and the
 * new half of a split (the splittee keeps running and is stopped by its
 * own reconfiguration). For those the task acknowledges itself through
 * the executor loopback, keeping a single code path to the next phase.
 */
use crate::commit::CommitWait;
use crate::drop_epoch::DropEpochWait;
use crate::message::{AckStopEpoch, Envelope, Outbound, Packet, PacketType, StartEpoch, StopEpoch};
use crate::record::{RecordRequest, RecordState, RequestKind};
use crate::start_epoch::StartEpochWait;
use crate::task::{task_key, Completion, ProtocolTask, Quorum, Restart, TaskError};
use crate::{Env, Group, NodeId};
use tracing::{debug, warn};

pub struct StopEpochWait<N: NodeId> {
    my_id: N,
    start_epoch: StartEpoch<N>,
    stop: StopEpoch,
    quorum: Quorum<N>,
    final_state: Option<String>,
    restarts: u32,
    key: String,
}

impl<N: NodeId> StopEpochWait<N> {
    pub fn new(my_id: N, start_epoch: StartEpoch<N>) -> Result<Self, TaskError> {
        let spoofed = Self::spoofed(&start_epoch);
        let quorum = if spoofed {
            Quorum::new(&Group::unit(my_id.clone()), 1)?
        } else {
            Quorum::new(&start_epoch.prev_group, 1)?.prefer(&my_id)
        };
        let stop = StopEpoch {
            service_name: start_epoch.prev_group_name.clone(),
            epoch: start_epoch.prev_epoch,
            get_final_state: start_epoch.requires_final_state,
        };
        let key = task_key(
            "StopEpochWait",
            &my_id,
            &start_epoch.service_name,
            start_epoch.epoch,
        );
        Ok(StopEpochWait {
            my_id,
            start_epoch,
            stop,
            quorum,
            final_state: None,
            restarts: 0,
            key,
        })
    }

    /// Nothing to actually stop: acknowledge ourselves instead.
    fn spoofed(se: &StartEpoch<N>) -> bool {
        se.is_init_epoch() || se.is_split
    }

    pub(crate) fn start_epoch(&self) -> &StartEpoch<N> {
        &self.start_epoch
    }

    fn probe(&self) -> Vec<Outbound<N>> {
        if Self::spoofed(&self.start_epoch) {
            vec![Outbound::to_one(
                self.my_id.clone(),
                Packet::AckStopEpoch(AckStopEpoch {
                    service_name: self.stop.service_name.clone(),
                    epoch: self.stop.epoch,
                    final_state: None,
                }),
            )]
        } else {
            vec![Outbound::to_one(
                self.quorum.current().clone(),
                Packet::StopEpoch(self.stop.clone()),
            )]
        }
    }

    /// The durable record has moved past us: another initiator finished
    /// (or deleted) this epoch change.
    pub(crate) fn obviated<E: Env<N>>(&self, env: &E) -> bool {
        let se = &self.start_epoch;
        match env.record(&se.service_name) {
            None => true,
            Some(r) => {
                r.epoch > se.epoch
                    || (r.epoch == se.epoch && r.is_ready())
                    || r.state == RecordState::WaitDelete
            }
        }
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for StopEpochWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckStopEpoch]
    }

    fn start(&mut self, _env: &mut E) -> Vec<Outbound<N>> {
        self.probe()
    }

    fn restart(&mut self, env: &mut E) -> Restart<N> {
        if self.obviated(env) {
            return Restart::Cancel;
        }
        self.restarts += 1;
        if self.restarts % 2 == 0 {
            warn!(se = %self.start_epoch, restarts = self.restarts,
                  "still waiting for stop acknowledgment");
        }
        self.quorum.advance();
        Restart::Resend(self.probe())
    }

    fn handle_event(&mut self, _env: &mut E, msg: &Envelope<N>) -> bool {
        let ack = match &msg.body {
            Packet::AckStopEpoch(a) => a,
            _ => return false,
        };
        if ack.service_name != self.stop.service_name || ack.epoch != self.stop.epoch {
            return false;
        }
        if self.stop.get_final_state && ack.final_state.is_none() {
            debug!(se = %self.start_epoch, from = ?msg.sender,
                   "stop ack without required final state, ignoring");
            return false;
        }
        if !self.quorum.record(&msg.sender) {
            return false;
        }
        // Remember who stopped: new-group members pulling state try the
        // acker first.
        self.start_epoch.first_prev_candidate = Some(msg.sender.clone());
        if ack.final_state.is_some() {
            self.final_state = ack.final_state.clone();
        }
        true
    }

    fn threshold_reached(&self) -> bool {
        self.quorum.reached()
    }

    fn handle_threshold_event(&mut self, env: &mut E) -> Completion<N, E> {
        let se = &self.start_epoch;
        debug!(se = %se, "previous epoch stopped");
        if se.is_deletion() {
            // No epoch to start; commit the delete and garbage-collect the
            // stopped group's retained state.
            let req = RecordRequest::new(self.my_id.clone(), se.clone(), RequestKind::Delete);
            let mut c = Completion::send(vec![Outbound::broadcast(
                env.reconfigurators().without(&self.my_id),
                Packet::RcRecordRequest(req.clone()),
            )]);
            if !env.commit(&req) {
                c = c.and_spawn(Box::new(CommitWait::new(self.my_id.clone(), req)));
            }
            match DropEpochWait::new(self.my_id.clone(), se.clone()) {
                Ok(t) => c.and_spawn(Box::new(t)),
                Err(e) => {
                    warn!(se = %se, err = %e, "cannot garbage-collect deleted epoch");
                    c
                }
            }
        } else if se.is_merge {
            // Fold the mergee's final state into the target's next epoch.
            let mut merged = se.clone();
            merged.initial_state = self.final_state.take();
            let req = RecordRequest::new(self.my_id.clone(), merged, RequestKind::Merge);
            Completion::spawn(Box::new(CommitWait::new(self.my_id.clone(), req)))
        } else {
            match StartEpochWait::new(self.my_id.clone(), se.clone()) {
                Ok(t) => Completion::spawn(Box::new(t)),
                Err(e) => {
                    warn!(se = %se, err = %e, "cannot start next epoch");
                    Completion::none()
                }
            }
        }
    }
}
