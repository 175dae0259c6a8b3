// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The reconfigurator-node dispatcher: entry point for client name
 * operations (create, delete, lookup), demand reports, and the record
 * requests reconfigurators exchange among themselves.
 *
 * Every epoch change funnels through [`Reconfigurator::initiate`]: commit
 * an intent, tell the peer reconfigurators, start the stop phase. Peers
 * that learn of a committed intent they did not initiate spawn a
 * [`PrimaryExecutionWait`] backup, so the change completes even if the
 * initiator crashes mid-way.
 *
 * [`Reconfigurator::recover`] rebuilds in-flight tasks from the durable
 * records alone; nothing about a reconfiguration's progress lives only in
 * memory.
 */
use crate::commit::CommitWait;
use crate::executor::{Dispatch, Dispatcher};
use crate::message::{
    ActiveReplicas, CreateConfirmation, Envelope, Outbound, Packet, PacketType, StartEpoch,
};
use crate::primary::PrimaryExecutionWait;
use crate::record::{RecordRequest, RecordState, RequestKind};
use crate::stop_epoch::StopEpochWait;
use crate::start_epoch::StartEpochWait;
use crate::drop_epoch::DropEpochWait;
use crate::task::{task_key, ProtocolTask};
use crate::{Env, Group, NodeId};
use tracing::{debug, info, warn};

pub struct Reconfigurator<N: NodeId> {
    my_id: N,
}

impl<N: NodeId> Reconfigurator<N> {
    pub fn new(my_id: N) -> Self {
        Reconfigurator { my_id }
    }

    /// Begin an epoch change: commit the intent, fan it out to peer
    /// reconfigurators, and drive the stop phase (deferring through a
    /// [`CommitWait`] if the intent cannot commit yet).
    fn initiate<E: Env<N>>(&self, env: &mut E, se: StartEpoch<N>) -> Dispatch<N, E> {
        info!(se = %se, "initiating epoch change");
        let req = RecordRequest::new(self.my_id.clone(), se, RequestKind::Intent);
        let d = Dispatch::send(vec![Outbound::broadcast(
            env.reconfigurators().without(&self.my_id),
            Packet::RcRecordRequest(req.clone()),
        )]);
        if env.commit(&req) {
            match StopEpochWait::new(self.my_id.clone(), req.start_epoch) {
                Ok(t) => d.and_spawn(Box::new(t)),
                Err(e) => {
                    warn!(err = %e, "cannot begin stop phase");
                    d
                }
            }
        } else {
            d.and_spawn(Box::new(CommitWait::new(self.my_id.clone(), req)))
        }
    }

    fn handle_create<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let create = match &msg.body {
            Packet::CreateServiceName(c) => c,
            _ => return Dispatch::none(),
        };
        if let Some(r) = env.record(&create.service_name) {
            return if r.is_ready() {
                // Re-sent creation of an existing service: confirm again.
                Dispatch::send(vec![Outbound::to_one(
                    create.creator.clone(),
                    Packet::CreateConfirmation(CreateConfirmation {
                        service_name: create.service_name.clone(),
                        epoch: r.epoch,
                    }),
                )
                .with_key(msg.key.clone())])
            } else {
                debug!(name = %create.service_name, "creation already in flight");
                Dispatch::none()
            };
        }
        let group = env.placement(&create.service_name);
        if group.is_empty() {
            warn!(name = %create.service_name, "no placement for new service, dropping create");
            return Dispatch::none();
        }
        let mut se = StartEpoch::new(
            self.my_id.clone(),
            &create.service_name,
            0,
            group,
            Group::new(),
        )
        .with_creator(create.creator.clone());
        if let Some(state) = &create.initial_state {
            se = se.with_initial_state(state.clone());
        }
        self.initiate(env, se)
    }

    fn handle_delete<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let delete = match &msg.body {
            Packet::DeleteServiceName(d) => d,
            _ => return Dispatch::none(),
        };
        match env.record(&delete.service_name) {
            Some(r) if r.is_ready() => {
                let se = StartEpoch::new(
                    self.my_id.clone(),
                    &delete.service_name,
                    r.epoch + 1,
                    Group::new(),
                    r.actives.clone(),
                );
                self.initiate(env, se)
            }
            Some(_) => {
                // Mid-reconfiguration; the client retries once it settles.
                debug!(name = %delete.service_name, "delete while record busy, dropping");
                Dispatch::none()
            }
            None => Dispatch::none(),
        }
    }

    fn handle_request_actives<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let req = match &msg.body {
            Packet::RequestActiveReplicas(r) => r,
            _ => return Dispatch::none(),
        };
        match env.record(&req.service_name) {
            Some(r) => Dispatch::send(vec![Outbound::to_one(
                msg.sender.clone(),
                Packet::ActiveReplicas(ActiveReplicas {
                    service_name: req.service_name.clone(),
                    epoch: r.epoch,
                    group: r.actives.clone(),
                }),
            )
            .with_key(msg.key.clone())]),
            None => {
                debug!(name = %req.service_name, "lookup for unknown service");
                Dispatch::none()
            }
        }
    }

    fn handle_demand<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let report = match &msg.body {
            Packet::DemandReport(d) => d,
            _ => return Dispatch::none(),
        };
        let record = match env.record(&report.service_name) {
            Some(r) if r.is_ready() => r,
            _ => return Dispatch::none(),
        };
        match env.suggest_group(&report.service_name, report.demand) {
            Some(group) if group != record.actives && !group.is_empty() => {
                let se = StartEpoch::new(
                    self.my_id.clone(),
                    &report.service_name,
                    record.epoch + 1,
                    group,
                    record.actives.clone(),
                );
                self.initiate(env, se)
            }
            _ => Dispatch::none(),
        }
    }

    /// A record request from a peer reconfigurator: commit it locally,
    /// then either shadow the initiator (intent) or stand down our own
    /// tasks for the epoch change it finished (complete, delete, merge).
    fn handle_record_request<E: Env<N>>(&self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        let req = match &msg.body {
            Packet::RcRecordRequest(r) => r,
            _ => return Dispatch::none(),
        };
        let handled = env.commit(req);
        let se = &req.start_epoch;
        match req.kind {
            RequestKind::Intent => {
                if req.initiator == self.my_id {
                    return Dispatch::none();
                }
                // Even if our commit was a no-op (the intent already took
                // effect through consensus), an in-flight record means the
                // change deserves a backup.
                let in_flight = handled
                    || env
                        .record(&se.service_name)
                        .map_or(false, |r| r.state == RecordState::WaitAckStop);
                if !in_flight {
                    return Dispatch::none();
                }
                match StopEpochWait::new(self.my_id.clone(), se.clone())
                    .and_then(|inner| PrimaryExecutionWait::new(self.my_id.clone(), inner))
                {
                    Ok(t) => Dispatch::spawn(Box::new(t)),
                    Err(e) => {
                        warn!(se = %se, err = %e, "cannot shadow epoch change");
                        Dispatch::none()
                    }
                }
            }
            RequestKind::Complete | RequestKind::Delete => Dispatch::none()
                .and_cancel(task_key(
                    "StopEpochWait",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                ))
                .and_cancel(task_key(
                    "StartEpochWait",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                ))
                .and_cancel(task_key(
                    "PrimaryExecutionWait",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                ))
                .and_cancel(task_key(
                    "CommitWait:Intent",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                )),
            RequestKind::Merge => Dispatch::none()
                .and_cancel(task_key(
                    "StopEpochWait",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                ))
                .and_cancel(task_key(
                    "PrimaryExecutionWait",
                    &self.my_id,
                    &se.service_name,
                    se.epoch,
                )),
            RequestKind::PrevDropComplete => Dispatch::none(),
        }
    }

    /// Rebuild in-flight tasks from the durable records after a restart.
    /// The caller spawns the returned tasks into a fresh executor.
    pub fn recover<E: Env<N>>(&self, env: &E) -> Vec<Box<dyn ProtocolTask<N, E>>> {
        let mut tasks: Vec<Box<dyn ProtocolTask<N, E>>> = Vec::new();
        for r in env.records() {
            if r.is_ready() {
                continue;
            }
            // The record keeps the command that opened the transition, so
            // creations recover their initial state and creator, and merges
            // and splits recover their flags. Synthesizing from the groups
            // alone is a fallback for stores that predate `pending`.
            let se = match r.pending.clone() {
                Some(se) => se,
                None if r.state == RecordState::WaitDelete => StartEpoch::new(
                    self.my_id.clone(),
                    &r.service_name,
                    r.epoch + 1,
                    Group::new(),
                    r.actives.clone(),
                ),
                None if r.epoch == 0 && r.actives.is_empty() => StartEpoch::new(
                    self.my_id.clone(),
                    &r.service_name,
                    0,
                    r.new_actives.clone(),
                    Group::new(),
                ),
                None => StartEpoch::new(
                    self.my_id.clone(),
                    &r.service_name,
                    r.epoch + 1,
                    r.new_actives.clone(),
                    r.actives.clone(),
                ),
            };
            info!(se = %se, state = ?r.state, "recovering in-flight epoch change");
            let task: Result<Box<dyn ProtocolTask<N, E>>, _> = match r.state {
                RecordState::WaitAckStop => {
                    StopEpochWait::new(self.my_id.clone(), se).map(|t| Box::new(t) as _)
                }
                RecordState::WaitAckStart => {
                    StartEpochWait::new(self.my_id.clone(), se).map(|t| Box::new(t) as _)
                }
                RecordState::WaitDelete => {
                    DropEpochWait::new(self.my_id.clone(), se).map(|t| Box::new(t) as _)
                }
                RecordState::Ready => continue,
            };
            match task {
                Ok(t) => tasks.push(t),
                Err(e) => warn!(name = %r.service_name, err = %e, "unrecoverable record"),
            }
        }
        tasks
    }
}

impl<N: NodeId, E: Env<N>> Dispatcher<N, E> for Reconfigurator<N> {
    fn local_types(&self) -> &'static [PacketType] {
        &[
            PacketType::CreateServiceName,
            PacketType::DeleteServiceName,
            PacketType::RequestActiveReplicas,
            PacketType::DemandReport,
            PacketType::RcRecordRequest,
        ]
    }

    fn handle(&mut self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E> {
        match msg.body.kind() {
            PacketType::CreateServiceName => self.handle_create(env, msg),
            PacketType::DeleteServiceName => self.handle_delete(env, msg),
            PacketType::RequestActiveReplicas => self.handle_request_actives(env, msg),
            PacketType::DemandReport => self.handle_demand(env, msg),
            PacketType::RcRecordRequest => self.handle_record_request(env, msg),
            _ => Dispatch::none(),
        }
    }
}
