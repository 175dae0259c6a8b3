// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The active-replica dispatcher: handles the epoch lifecycle commands a
 * reconfigurator sends to the nodes actually hosting replicas. Stop,
 * final-state serving, and drop are answered inline against the
 * application coordinator; a [`StartEpoch`] that needs state transfer
 * spawns an [`EpochFinalStateWait`] to pull it.
 *
 * Every reply echoes the correlation key of the request, so it lands at
 * the exact wait-task the reconfigurator is running. All handlers are
 * idempotent: a re-delivered command re-derives the same answer from the
 * coordinator rather than tracking what was already sent.
 */
use crate::executor::{Dispatch, Dispatcher};
use crate::final_state::EpochFinalStateWait;
use crate::message::{
    AckDropEpochFinalState, AckStartEpoch, AckStopEpoch, Envelope, EpochFinalState, Outbound,
    Packet, PacketType,
};
use crate::{Env, NodeId};
use tracing::{debug, info, warn};

pub struct ActiveReplica<N: NodeId> {
    my_id: N,
}

impl<N: NodeId> ActiveReplica<N> {
    pub fn new(my_id: N) -> Self {
        ActiveReplica { my_id }
    }

    fn handle_stop<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let stop = match &msg.body {
            Packet::StopEpoch(s) => s,
            _ => return Dispatch::none(),
        };
        if env.current_epoch(&stop.service_name) == Some(stop.epoch) {
            info!(name = %stop.service_name, epoch = stop.epoch, "stopping epoch");
            if env.stop_replica_group(&stop.service_name, stop.epoch) {
                env.checkpoint(&stop.service_name, stop.epoch);
            }
        }
        let final_state = if stop.get_final_state {
            match env.final_state(&stop.service_name, stop.epoch) {
                Some(s) => Some(s),
                None => {
                    // We never hosted (or already dropped) this epoch; an
                    // ack without the state would be useless to the waiter.
                    debug!(name = %stop.service_name, epoch = stop.epoch,
                           "no final state to return with stop ack");
                    return Dispatch::none();
                }
            }
        } else {
            None
        };
        Dispatch::send(vec![Outbound::to_one(
            msg.sender.clone(),
            Packet::AckStopEpoch(AckStopEpoch {
                service_name: stop.service_name.clone(),
                epoch: stop.epoch,
                final_state,
            }),
        )
        .with_key(msg.key.clone())])
    }

    fn handle_start<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let se = match &msg.body {
            Packet::StartEpoch(s) => s,
            _ => return Dispatch::none(),
        };
        let ack = Outbound::to_one(
            msg.sender.clone(),
            Packet::AckStartEpoch(AckStartEpoch {
                service_name: se.service_name.clone(),
                epoch: se.epoch,
            }),
        )
        .with_key(msg.key.clone());
        if env
            .current_epoch(&se.service_name)
            .map_or(false, |e| e >= se.epoch)
        {
            // Already there (a re-broadcast, or a pull that finished);
            // just re-acknowledge.
            return Dispatch::send(vec![ack]);
        }
        if se.is_init_epoch() || !se.requires_final_state {
            let state = se.initial_state.as_deref();
            if env.create_replica_group(&se.service_name, se.epoch, state, &se.cur_group) {
                info!(name = %se.service_name, epoch = se.epoch, "started epoch");
                Dispatch::send(vec![ack])
            } else {
                debug!(se = %se, "could not start epoch, awaiting re-broadcast");
                Dispatch::none()
            }
        } else {
            match EpochFinalStateWait::new(
                &self.my_id,
                se.clone(),
                msg.sender.clone(),
                msg.key.clone(),
            ) {
                Ok(t) => Dispatch::spawn(Box::new(t)),
                Err(e) => {
                    warn!(se = %se, err = %e, "cannot pull previous epoch state");
                    Dispatch::none()
                }
            }
        }
    }

    fn handle_final_state_request<E: Env<N>>(
        &self,
        env: &mut E,
        msg: &Envelope<N>,
    ) -> Dispatch<N, E> {
        let req = match &msg.body {
            Packet::RequestEpochFinalState(r) => r,
            _ => return Dispatch::none(),
        };
        match env.final_state(&req.service_name, req.epoch) {
            Some(state) => Dispatch::send(vec![Outbound::to_one(
                msg.sender.clone(),
                Packet::EpochFinalState(EpochFinalState {
                    service_name: req.service_name.clone(),
                    epoch: req.epoch,
                    state,
                }),
            )
            .with_key(msg.key.clone())]),
            None => {
                // The requester round-robins to the next previous-group
                // member on its own clock; silence is the correct answer.
                debug!(name = %req.service_name, epoch = req.epoch,
                       "final state requested but not held here");
                Dispatch::none()
            }
        }
    }

    fn handle_drop<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let drop = match &msg.body {
            Packet::DropEpochFinalState(d) => d,
            _ => return Dispatch::none(),
        };
        env.delete_final_state(&drop.service_name, drop.epoch);
        Dispatch::send(vec![Outbound::to_one(
            msg.sender.clone(),
            Packet::AckDropEpochFinalState(AckDropEpochFinalState {
                service_name: drop.service_name.clone(),
                epoch: drop.epoch,
            }),
        )
        .with_key(msg.key.clone())])
    }
}

impl<N: NodeId, E: Env<N>> Dispatcher<N, E> for ActiveReplica<N> {
    fn local_types(&self) -> &'static [PacketType] {
        &[
            PacketType::StartEpoch,
            PacketType::StopEpoch,
            PacketType::RequestEpochFinalState,
            PacketType::DropEpochFinalState,
        ]
    }

    fn handle(&mut self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        match msg.body.kind() {
            PacketType::StopEpoch => self.handle_stop(env, msg),
            PacketType::StartEpoch => self.handle_start(env, msg),
            PacketType::RequestEpochFinalState => self.handle_final_state_request(env, msg),
            PacketType::DropEpochFinalState => self.handle_drop(env, msg),
            _ => Dispatch::none(),
        }
    }
}
