// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * [`CommitWait`] retries a [`RecordRequest`] until it commits or is
 * obviated. Commits can fail transiently (the consensus group is
 * electing, the store is catching up), and the protocol tasks must not
 * stall on that: they hand the request to a `CommitWait` and move on.
 *
 * The task consumes no packets at all; it lives entirely off the
 * executor's restart clock, re-attempting the commit each period and
 * checking the record to see whether some other initiator got there
 * first.
 */
use crate::message::{Envelope, Outbound, PacketType};
use crate::record::{RecordRequest, RecordState, RequestKind};
use crate::stop_epoch::StopEpochWait;
use crate::task::{task_key, Completion, ProtocolTask, Restart};
use crate::{Env, NodeId};
use tracing::{debug, warn};

pub struct CommitWait<N: NodeId> {
    my_id: N,
    req: RecordRequest<N>,
    committed: bool,
    key: String,
}

impl<N: NodeId> CommitWait<N> {
    pub fn new(my_id: N, req: RecordRequest<N>) -> Self {
        let key = task_key(
            &format!("CommitWait:{:?}", req.kind),
            &my_id,
            req.service_name(),
            req.start_epoch.epoch,
        );
        CommitWait {
            my_id,
            req,
            committed: false,
            key,
        }
    }

    /// Whether the record already shows this exact request applied. That
    /// happens when a peer reconfigurator commits our relayed request
    /// before we do; it counts as success, not obviation, so the
    /// follow-up still runs here.
    fn reflected<E: Env<N>>(&self, env: &E) -> bool {
        let se = &self.req.start_epoch;
        let target = se.epoch;
        let r = match env.record(self.req.service_name()) {
            Some(r) => r,
            None => return false,
        };
        match self.req.kind {
            RequestKind::Intent => {
                r.state == RecordState::WaitAckStop
                    && r.new_actives == se.cur_group
                    && (r.epoch + 1 == target || (se.is_init_epoch() && r.epoch == target))
            }
            RequestKind::Complete => r.is_ready() && r.epoch >= target,
            RequestKind::Delete => r.state == RecordState::WaitDelete && r.epoch + 1 == target,
            RequestKind::Merge => false,
            RequestKind::PrevDropComplete => r.prev_dropped && r.epoch == target,
        }
    }

    /// Whether the record has moved past this request, making the retry
    /// pointless.
    fn obviated<E: Env<N>>(&self, env: &E) -> bool {
        let target = self.req.start_epoch.epoch;
        let r = match env.record(self.req.service_name()) {
            Some(r) => r,
            None => return self.req.kind == RequestKind::Delete,
        };
        match self.req.kind {
            RequestKind::Intent => !r.is_ready() || r.epoch >= target,
            RequestKind::Complete => r.epoch >= target && r.is_ready(),
            RequestKind::Delete => r.state == RecordState::WaitDelete || r.epoch >= target,
            RequestKind::Merge => r.epoch >= target,
            RequestKind::PrevDropComplete => r.prev_dropped || r.epoch != target,
        }
    }
}

impl<N: NodeId, E: Env<N>> ProtocolTask<N, E> for CommitWait<N> {
    fn key(&self) -> &str {
        &self.key
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[]
    }

    fn start(&mut self, env: &mut E) -> Vec<Outbound<N>> {
        self.committed = env.commit(&self.req);
        if !self.committed {
            debug!(req = %self.req, "commit deferred, will retry");
        }
        Vec::new()
    }

    fn restart(&mut self, env: &mut E) -> Restart<N> {
        if self.committed || self.reflected(env) {
            return Restart::Finish;
        }
        if self.obviated(env) {
            return Restart::Cancel;
        }
        self.committed = env.commit(&self.req);
        if self.committed {
            Restart::Finish
        } else {
            Restart::Resend(Vec::new())
        }
    }

    fn handle_event(&mut self, _env: &mut E, _msg: &Envelope<N>) -> bool {
        false
    }

    fn handle_threshold_event(&mut self, _env: &mut E) -> Completion<N, E> {
        // A committed intent belongs to an initiator that must now drive
        // the stop phase; other request kinds need no follow-up here.
        if self.req.kind == RequestKind::Intent && self.req.initiator == self.my_id {
            match StopEpochWait::new(self.my_id.clone(), self.req.start_epoch.clone()) {
                Ok(t) => return Completion::spawn(Box::new(t)),
                Err(e) => {
                    warn!(req = %self.req, err = %e, "cannot begin stop phase")
                }
            }
        }
        Completion::none()
    }
}
