// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * Second phase of an epoch change: [`StartEpochWait`] broadcasts the
 * [`StartEpoch`] command to the new group and waits for a majority of
 * members to report the new epoch installed. A majority of started
 * replicas is what makes the new epoch durable, so reaching it is the
 * point at which the record's `Complete` request commits.
 */
use crate::commit::CommitWait;
use crate::drop_epoch::DropEpochWait;
use crate::message::{
    CreateConfirmation, Envelope, Outbound, Packet, PacketType, StartEpoch,
};
use crate::record::{RecordRequest, RecordState, RequestKind};
use crate::task::{task_key, Completion, ProtocolTask, Quorum, Restart, TaskError, DEFAULT_RESTART_PERIOD};
use crate::{Env, NodeId};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct StartEpochWait<N: NodeId> {
    my_id: N,
    start_epoch: StartEpoch<N>,
    quorum: Quorum<N>,
    restarts: u32,
    key: String,
}

impl<N: NodeId> StartEpochWait<N> {
    pub fn new(my_id: N, start_epoch: StartEpoch<N>) -> Result<Self, TaskError> {
        let quorum = Quorum::majority_of(&start_epoch.cur_group)?;
        let key = task_key(
            "StartEpochWait",
            &my_id,
            &start_epoch.service_name,
            start_epoch.epoch,
        );
        Ok(StartEpochWait {
            my_id,
            start_epoch,
            quorum,
            restarts: 0,
            key,
        })
    }

    fn obviated<E: Env<N>>(&self, env: &E) -> bool {
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

    fn broadcast(&self) -> Vec<Outbound<N>> {
        vec![Outbound::broadcast(
            self.start_epoch.cur_group.clone(),
            Packet::StartEpoch(self.start_epoch.clone()),
        )]
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for StartEpochWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckStartEpoch]
    }

    // State transfer can take a while; re-broadcast less eagerly than the
    // probing tasks.
    fn period(&self) -> Duration {
        DEFAULT_RESTART_PERIOD * 2
    }

    fn start(&mut self, _env: &mut E) -> Vec<Outbound<N>> {
        self.broadcast()
    }

    fn restart(&mut self, env: &mut E) -> Restart<N> {
        if self.obviated(env) {
            return Restart::Cancel;
        }
        self.restarts += 1;
        if self.restarts % 2 == 0 {
            warn!(se = %self.start_epoch, restarts = self.restarts,
                  acked = self.quorum.ackers().len(),
                  "still waiting for start acknowledgments");
        }
        Restart::Resend(self.broadcast())
    }

    fn handle_event(&mut self, _env: &mut E, msg: &Envelope<N>) -> bool {
        let ack = match &msg.body {
            Packet::AckStartEpoch(a) => a,
            _ => return false,
        };
        if ack.service_name != self.start_epoch.service_name
            || ack.epoch != self.start_epoch.epoch
        {
            return false;
        }
        self.quorum.record(&msg.sender)
    }

    fn threshold_reached(&self) -> bool {
        self.quorum.reached()
    }

    fn handle_threshold_event(&mut self, env: &mut E) -> Completion<N, E> {
        let se = &self.start_epoch;
        info!(se = %se, "new epoch started on a majority");
        let req = RecordRequest::new(self.my_id.clone(), se.clone(), RequestKind::Complete);
        let mut c = Completion::send(vec![Outbound::broadcast(
            env.reconfigurators().without(&self.my_id),
            Packet::RcRecordRequest(req.clone()),
        )]);
        if !env.commit(&req) {
            c = c.and_spawn(Box::new(CommitWait::new(self.my_id.clone(), req)));
        }
        if se.is_init_epoch() {
            if let Some(creator) = &se.creator {
                c = c.and_send(vec![Outbound::to_one(
                    creator.clone(),
                    Packet::CreateConfirmation(CreateConfirmation {
                        service_name: se.service_name.clone(),
                        epoch: se.epoch,
                    }),
                )]);
            }
        } else {
            // The new epoch is durable; reclaim the old one's final state.
            match DropEpochWait::new(self.my_id.clone(), se.clone()) {
                Ok(t) => c = c.and_spawn(Box::new(t)),
                Err(e) => debug!(se = %se, err = %e, "no previous epoch state to drop"),
            }
        }
        c
    }
}
