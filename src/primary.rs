// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * [`PrimaryExecutionWait`]: the backup a non-initiating reconfigurator
 * runs when it learns (via a committed intent) that a peer is driving an
 * epoch change. The backup stays passive for a grace period; if the
 * record then still shows the change in flight it takes over, re-running
 * the stop phase exactly as the initiator would have.
 *
 * It also listens promiscuously for the later-phase acknowledgments of
 * the same epoch change: seeing one proves the initiator got past the
 * stop phase, so the backup can skip straight to committing `Complete`
 * instead of re-stopping a group that already moved on.
 */
use crate::commit::CommitWait;
use crate::message::{Envelope, Outbound, Packet, PacketType};
use crate::record::{RecordRequest, RequestKind};
use crate::stop_epoch::StopEpochWait;
use crate::task::{task_key, Completion, ProtocolTask, Restart, TaskError, DEFAULT_RESTART_PERIOD};
use crate::{Env, NodeId};
use std::time::Duration;
use tracing::{debug, info};

pub struct PrimaryExecutionWait<N: NodeId> {
    my_id: N,
    inner: StopEpochWait<N>,
    started: bool,
    short_circuit: bool,
    key: String,
}

impl<N: NodeId> PrimaryExecutionWait<N> {
    pub fn new(my_id: N, inner: StopEpochWait<N>) -> Result<Self, TaskError> {
        let se = inner.start_epoch();
        let key = task_key("PrimaryExecutionWait", &my_id, &se.service_name, se.epoch);
        Ok(PrimaryExecutionWait {
            my_id,
            inner,
            started: false,
            short_circuit: false,
            key,
        })
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for PrimaryExecutionWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[
            PacketType::AckStopEpoch,
            PacketType::AckStartEpoch,
            PacketType::AckDropEpochFinalState,
        ]
    }

    // Grace period before second-guessing the primary.
    fn period(&self) -> Duration {
        DEFAULT_RESTART_PERIOD * 4
    }

    fn start(&mut self, _env: &mut E) -> Vec<Outbound<N>> {
        Vec::new()
    }

    fn restart(&mut self, env: &mut E) -> Restart<N> {
        if !self.started {
            if self.inner.obviated(env) {
                return Restart::Cancel;
            }
            info!(se = %self.inner.start_epoch(),
                  "primary silent past grace period, taking over epoch change");
            self.started = true;
            // The inner task never ran `start`, so probing begins at its
            // preferred first target rather than advancing past it.
            return Restart::Resend(<StopEpochWait<N> as ProtocolTask<N, E>>::start(
                &mut self.inner,
                env,
            ));
        }
        // Delegates obviation too: if the primary finished, this cancels.
        <StopEpochWait<N> as ProtocolTask<N, E>>::restart(&mut self.inner, env)
    }

    fn handle_event(&mut self, env: &mut E, msg: &Envelope<N>) -> bool {
        let se = self.inner.start_epoch();
        match &msg.body {
            // Later-phase acks prove the stop phase already happened
            // somewhere; skip to completion.
            Packet::AckStartEpoch(a)
                if a.service_name == se.service_name && a.epoch == se.epoch =>
            {
                debug!(se = %se, "observed start ack, short-circuiting backup");
                self.short_circuit = true;
                true
            }
            Packet::AckDropEpochFinalState(a)
                if a.service_name == se.prev_group_name && a.epoch == se.prev_epoch =>
            {
                self.short_circuit = true;
                true
            }
            Packet::AckStopEpoch(_) => self.inner.handle_event(env, msg),
            _ => false,
        }
    }

    // Acks of the shadowed epoch change are keyed to the primary's tasks,
    // not ours; claim them by content.
    fn matches(&self, msg: &Envelope<N>) -> bool {
        let se = self.inner.start_epoch();
        match &msg.body {
            Packet::AckStopEpoch(a) => {
                a.service_name == se.prev_group_name && a.epoch == se.prev_epoch
            }
            Packet::AckStartEpoch(a) => {
                a.service_name == se.service_name && a.epoch == se.epoch
            }
            Packet::AckDropEpochFinalState(a) => {
                a.service_name == se.prev_group_name && a.epoch == se.prev_epoch
            }
            _ => false,
        }
    }

    fn threshold_reached(&self) -> bool {
        self.short_circuit || <StopEpochWait<N> as ProtocolTask<N, E>>::threshold_reached(&self.inner)
    }

    fn handle_threshold_event(&mut self, env: &mut E) -> Completion<N, E> {
        if self.short_circuit {
            let se = self.inner.start_epoch();
            let req = RecordRequest::new(self.my_id.clone(), se.clone(), RequestKind::Complete);
            if env.commit(&req) {
                Completion::none()
            } else {
                Completion::spawn(Box::new(CommitWait::new(self.my_id.clone(), req)))
            }
        } else {
            self.inner.handle_threshold_event(env)
        }
    }
}
