// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * Last phase of an epoch change: [`DropEpochWait`] tells the previous
 * group to garbage-collect the final state it retained for transfer.
 * This is cleanup, not safety: the task gives up after a bounded number
 * of restarts, and an unreachable member merely keeps a stale checkpoint
 * around until it next hears a drop.
 */
use crate::message::{DropEpochFinalState, Envelope, Outbound, Packet, PacketType, StartEpoch};
use crate::record::{RecordRequest, RequestKind};
use crate::task::{task_key, Completion, ProtocolTask, Quorum, Restart, TaskError};
use crate::{Env, Group, NodeId};
use tracing::{debug, warn};

const MAX_RESTARTS: u32 = 5;

pub struct DropEpochWait<N: NodeId> {
    my_id: N,
    start_epoch: StartEpoch<N>,
    quorum: Quorum<N>,
    restarts: u32,
    key: String,
}

impl<N: NodeId> DropEpochWait<N> {
    pub fn new(my_id: N, start_epoch: StartEpoch<N>) -> Result<Self, TaskError> {
        let quorum = Quorum::majority_of(&start_epoch.prev_group)?;
        let key = task_key(
            "DropEpochWait",
            &my_id,
            &start_epoch.service_name,
            start_epoch.epoch,
        );
        Ok(DropEpochWait {
            my_id,
            start_epoch,
            quorum,
            restarts: 0,
            key,
        })
    }

    /// Re-send only to members that have not acknowledged yet.
    fn remaining(&self) -> Vec<Outbound<N>> {
        let to: Group<N> = self
            .quorum
            .group()
            .iter()
            .filter(|n| !self.quorum.acked(n))
            .cloned()
            .collect();
        if to.is_empty() {
            return Vec::new();
        }
        vec![Outbound::broadcast(
            to,
            Packet::DropEpochFinalState(DropEpochFinalState {
                service_name: self.start_epoch.prev_group_name.clone(),
                epoch: self.start_epoch.prev_epoch,
            }),
        )]
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for DropEpochWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckDropEpochFinalState]
    }

    fn start(&mut self, _env: &mut E) -> Vec<Outbound<N>> {
        self.remaining()
    }

    fn restart(&mut self, _env: &mut E) -> Restart<N> {
        self.restarts += 1;
        if self.restarts > MAX_RESTARTS {
            warn!(se = %self.start_epoch, "giving up on epoch cleanup");
            return Restart::Cancel;
        }
        Restart::Resend(self.remaining())
    }

    fn handle_event(&mut self, _env: &mut E, msg: &Envelope<N>) -> bool {
        let ack = match &msg.body {
            Packet::AckDropEpochFinalState(a) => a,
            _ => return false,
        };
        if ack.service_name != self.start_epoch.prev_group_name
            || ack.epoch != self.start_epoch.prev_epoch
        {
            return false;
        }
        self.quorum.record(&msg.sender)
    }

    fn threshold_reached(&self) -> bool {
        self.quorum.reached()
    }

    fn handle_threshold_event(&mut self, env: &mut E) -> Completion<N, E> {
        debug!(se = %self.start_epoch, "previous epoch state dropped on a majority");
        let req = RecordRequest::new(
            self.my_id.clone(),
            self.start_epoch.clone(),
            RequestKind::PrevDropComplete,
        );
        // Best effort; a lost drop marker just means a redundant future
        // cleanup attempt.
        env.commit(&req);
        Completion::none()
    }
}
