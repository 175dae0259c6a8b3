// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * State transfer, active-replica side: [`EpochFinalStateWait`] runs on
 * each new-group member that received a [`StartEpoch`] but does not yet
 * have the previous epoch's final state. It pulls the state from
 * previous-group members one at a time (the member known to have stopped
 * first, when the command carries that hint), installs it, and only then
 * acknowledges the start back to whoever issued the command.
 *
 * The acknowledgment must reach the *initiator's* wait-task, not a task
 * of this node, so its correlation key is the one carried by the original
 * [`StartEpoch`] envelope rather than this task's own.
 */
use crate::message::{
    AckStartEpoch, Envelope, Outbound, Packet, PacketType, RequestEpochFinalState, StartEpoch,
};
use crate::task::{task_key, Completion, ProtocolTask, Quorum, Restart, TaskError};
use crate::{Env, NodeId};
use tracing::{debug, info, warn};

pub struct EpochFinalStateWait<N: NodeId> {
    start_epoch: StartEpoch<N>,
    quorum: Quorum<N>,
    notifiee: N,
    notifiee_key: Option<String>,
    restarts: u32,
    key: String,
}

impl<N: NodeId> EpochFinalStateWait<N> {
    pub fn new(
        my_id: &N,
        start_epoch: StartEpoch<N>,
        notifiee: N,
        notifiee_key: Option<String>,
    ) -> Result<Self, TaskError> {
        let hint = start_epoch
            .first_prev_candidate
            .clone()
            .unwrap_or_else(|| my_id.clone());
        let quorum = Quorum::new(&start_epoch.prev_group, 1)?.prefer(&hint);
        let mut key = task_key(
            "EpochFinalStateWait",
            my_id,
            &start_epoch.service_name,
            start_epoch.epoch,
        );
        if start_epoch.prev_group_name != start_epoch.service_name {
            // Merges pull from a different service; one task per source.
            key = format!(
                "{}:{}:{}",
                key, start_epoch.prev_group_name, start_epoch.prev_epoch
            );
        }
        Ok(EpochFinalStateWait {
            start_epoch,
            quorum,
            notifiee,
            notifiee_key,
            restarts: 0,
            key,
        })
    }

    fn probe(&self) -> Vec<Outbound<N>> {
        vec![Outbound::to_one(
            self.quorum.current().clone(),
            Packet::RequestEpochFinalState(RequestEpochFinalState {
                service_name: self.start_epoch.prev_group_name.clone(),
                epoch: self.start_epoch.prev_epoch,
            }),
        )]
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for EpochFinalStateWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::EpochFinalState]
    }

    fn start(&mut self, _env: &mut E) -> Vec<Outbound<N>> {
        self.probe()
    }

    fn restart(&mut self, env: &mut E) -> Restart<N> {
        // The local replica having reached the target epoch (through any
        // path) makes this pull moot.
        let se = &self.start_epoch;
        if env
            .current_epoch(&se.service_name)
            .map_or(false, |e| e >= se.epoch)
        {
            return Restart::Cancel;
        }
        self.restarts += 1;
        if self.restarts % 2 == 0 {
            warn!(se = %se, restarts = self.restarts,
                  "still trying to pull previous epoch final state");
        }
        self.quorum.advance();
        Restart::Resend(self.probe())
    }

    fn handle_event(&mut self, env: &mut E, msg: &Envelope<N>) -> bool {
        let fs = match &msg.body {
            Packet::EpochFinalState(f) => f,
            _ => return false,
        };
        let se = &self.start_epoch;
        if fs.service_name != se.prev_group_name || fs.epoch != se.prev_epoch {
            return false;
        }
        if !env.create_replica_group(&se.service_name, se.epoch, Some(&fs.state), &se.cur_group) {
            debug!(se = %se, "could not install pulled final state, will retry");
            return false;
        }
        info!(se = %se, from = ?msg.sender, "installed previous epoch final state");
        self.quorum.record(&msg.sender)
    }

    fn threshold_reached(&self) -> bool {
        self.quorum.reached()
    }

    fn handle_threshold_event(&mut self, _env: &mut E) -> Completion<N, E> {
        let se = &self.start_epoch;
        Completion::send(vec![Outbound::to_one(
            self.notifiee.clone(),
            Packet::AckStartEpoch(AckStartEpoch {
                service_name: se.service_name.clone(),
                epoch: se.epoch,
            }),
        )
        .with_key(self.notifiee_key.clone())])
    }
}
