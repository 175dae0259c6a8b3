// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The [`Executor`]: a single-threaded, transport-free task scheduler.
 *
 * One executor runs per node role (reconfigurator or active replica). It
 * owns the node's [`Env`], a [`Dispatcher`] for stateless packet types,
 * and a keyed map of live [`ProtocolTask`]s. The host process feeds it
 * received envelopes via [`Executor::receive`], advances logical time via
 * [`Executor::tick`], and ships whatever [`Executor::drain_outbox`]
 * returns. Nothing here blocks, spawns threads, or touches the network.
 *
 * Routing order for an incoming envelope:
 *
 *   1. packet types a dispatcher claims go to the dispatcher;
 *   2. an envelope carrying a key goes to the live task with that key,
 *      if its event set admits the packet type;
 *   3. otherwise any live task whose [`ProtocolTask::matches`] accepts
 *      the envelope gets it;
 *   4. otherwise the envelope is logged and dropped.
 *
 * Loopback: an outbound whose target set includes this node is requeued
 * locally, so a task can acknowledge itself through the same path remote
 * acks take.
 */
use crate::message::{Envelope, Outbound, Packet, PacketType};
use crate::task::{Completion, ProtocolTask, Restart};
use crate::{Env, Group, NodeId};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("a task with key {0} is already running")]
    DuplicateKey(String),
}

/// An envelope addressed to a set of remote nodes, ready for transport.
#[derive(Clone, Debug)]
pub struct Outgoing<N: NodeId> {
    pub to: Group<N>,
    pub envelope: Envelope<N>,
}

/// What a [`Dispatcher`] wants done with the packet it just handled.
pub struct Dispatch<N: NodeId, E: Env<N>> {
    pub messages: Vec<Outbound<N>>,
    pub spawn: Vec<Box<dyn ProtocolTask<N, E>>>,
    pub cancel: Vec<String>,
}

impl<N: NodeId, E: Env<N>> Dispatch<N, E> {
    pub fn none() -> Self {
        Dispatch {
            messages: Vec::new(),
            spawn: Vec::new(),
            cancel: Vec::new(),
        }
    }

    pub fn send(messages: Vec<Outbound<N>>) -> Self {
        Dispatch {
            messages,
            spawn: Vec::new(),
            cancel: Vec::new(),
        }
    }

    pub fn spawn(task: Box<dyn ProtocolTask<N, E>>) -> Self {
        Dispatch {
            messages: Vec::new(),
            spawn: vec![task],
            cancel: Vec::new(),
        }
    }

    pub fn and_send(mut self, mut messages: Vec<Outbound<N>>) -> Self {
        self.messages.append(&mut messages);
        self
    }

    pub fn and_spawn(mut self, task: Box<dyn ProtocolTask<N, E>>) -> Self {
        self.spawn.push(task);
        self
    }

    pub fn and_cancel(mut self, key: String) -> Self {
        self.cancel.push(key);
        self
    }
}

/// Stateless per-packet-type handling, for packets that are not (yet)
/// correlated with any task: demand-multiplexed name operations on a
/// reconfigurator, epoch lifecycle commands on an active replica.
pub trait Dispatcher<N: NodeId, E: Env<N>> {
    fn local_types(&self) -> &'static [PacketType];
    fn handle(&mut self, env: &mut E, msg: &Envelope<N>) -> Dispatch<N, E>;
}

struct Live<N: NodeId, E: Env<N>> {
    task: Box<dyn ProtocolTask<N, E>>,
    due: Duration,
}

pub struct Executor<N: NodeId, E: Env<N>> {
    my_id: N,
    env: E,
    dispatcher: Box<dyn Dispatcher<N, E>>,
    tasks: BTreeMap<String, Live<N, E>>,
    inbox: VecDeque<Envelope<N>>,
    outbox: Vec<Outgoing<N>>,
    now: Duration,
}

impl<N: NodeId, E: Env<N>> Executor<N, E> {
    pub fn new(my_id: N, env: E, dispatcher: Box<dyn Dispatcher<N, E>>) -> Self {
        Executor {
            my_id,
            env,
            dispatcher,
            tasks: BTreeMap::new(),
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            now: Duration::from_secs(0),
        }
    }

    pub fn my_id(&self) -> &N {
        &self.my_id
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn a task, failing if its key is already live.
    pub fn spawn(&mut self, mut task: Box<dyn ProtocolTask<N, E>>) -> Result<(), ExecutorError> {
        let key = task.refresh_key();
        if self.tasks.contains_key(&key) {
            return Err(ExecutorError::DuplicateKey(key));
        }
        debug!(key = %key, "spawning task");
        let sends = task.start(&mut self.env);
        let due = self.now + task.period();
        self.tasks.insert(key.clone(), Live { task, due });
        for m in sends {
            self.emit(Some(&key), m);
        }
        self.pump();
        Ok(())
    }

    /// Spawn unless an instance with the same key is already live.
    pub fn spawn_if_not_running(&mut self, task: Box<dyn ProtocolTask<N, E>>) -> bool {
        if self.tasks.contains_key(task.key()) {
            trace!(key = task.key(), "task already running");
            false
        } else {
            // cannot fail: we just checked the key
            let _ = self.spawn(task);
            true
        }
    }

    /// Retire a task without running its threshold action. Idempotent.
    pub fn cancel(&mut self, key: &str) -> bool {
        let had = self.tasks.remove(key).is_some();
        if had {
            debug!(key = %key, "cancelled task");
        }
        had
    }

    /// Enqueue a received envelope and process until quiescent.
    pub fn receive(&mut self, msg: Envelope<N>) {
        self.inbox.push_back(msg);
        self.pump();
    }

    /// Advance logical time: run restarts for every task whose period has
    /// elapsed, then process any loopback traffic that produced.
    pub fn tick(&mut self, now: Duration) {
        self.now = now;
        let due: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, l)| l.due <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let mut live = match self.tasks.remove(&key) {
                Some(l) => l,
                None => continue,
            };
            match live.task.restart(&mut self.env) {
                Restart::Resend(sends) => {
                    trace!(key = %key, "restarting task");
                    live.due = now + live.task.period();
                    self.tasks.insert(key.clone(), live);
                    for m in sends {
                        self.emit(Some(&key), m);
                    }
                }
                Restart::Cancel => {
                    debug!(key = %key, "task obviated, retiring");
                }
                Restart::Finish => {
                    debug!(key = %key, "task finished on restart");
                    let done = live.task.handle_threshold_event(&mut self.env);
                    self.complete(&key, done);
                }
            }
        }
        self.pump();
    }

    /// Take all accumulated remote-bound traffic.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing<N>> {
        std::mem::replace(&mut self.outbox, Vec::new())
    }

    fn pump(&mut self) {
        while let Some(msg) = self.inbox.pop_front() {
            self.route(msg);
        }
    }

    fn route(&mut self, msg: Envelope<N>) {
        let kind = msg.body.kind();
        if self.dispatcher.local_types().contains(&kind) {
            let d = self.dispatcher.handle(&mut self.env, &msg);
            self.apply_dispatch(d);
            return;
        }
        if let Some(key) = msg.key.clone() {
            if let Some(live) = self.tasks.get_mut(&key) {
                if live.task.event_types().contains(&kind) {
                    live.task.handle_event(&mut self.env, &msg);
                    self.retire_if_done(&key);
                    return;
                }
            }
        }
        // No keyed owner: offer to tasks that shadow other executions.
        let fallback = self
            .tasks
            .iter()
            .find(|(_, l)| l.task.event_types().contains(&kind) && l.task.matches(&msg))
            .map(|(k, _)| k.clone());
        if let Some(key) = fallback {
            if let Some(live) = self.tasks.get_mut(&key) {
                live.task.handle_event(&mut self.env, &msg);
            }
            self.retire_if_done(&key);
            return;
        }
        warn!(kind = ?kind, key = ?msg.key, "dropping unroutable packet");
    }

    fn retire_if_done(&mut self, key: &str) {
        let done = match self.tasks.get(key) {
            Some(l) if l.task.threshold_reached() => true,
            _ => return,
        };
        debug_assert!(done);
        if let Some(mut live) = self.tasks.remove(key) {
            debug!(key = %key, "task reached threshold");
            let c = live.task.handle_threshold_event(&mut self.env);
            self.complete(key, c);
        }
    }

    fn complete(&mut self, key: &str, c: Completion<N, E>) {
        for m in c.messages {
            self.emit(Some(key), m);
        }
        for t in c.spawn {
            self.spawn_if_not_running(t);
        }
    }

    fn apply_dispatch(&mut self, d: Dispatch<N, E>) {
        for key in &d.cancel {
            self.cancel(key);
        }
        for t in d.spawn {
            self.spawn_if_not_running(t);
        }
        for m in d.messages {
            self.emit(None, m);
        }
    }

    /// Stamp and ship one outbound: the explicit key wins, else the
    /// emitting task's key, else none. Local targets loop back through
    /// the inbox; remote targets accumulate in the outbox.
    fn emit(&mut self, default_key: Option<&str>, m: Outbound<N>) {
        let key = m.key.or_else(|| default_key.map(|k| k.to_string()));
        let envelope = Envelope {
            key,
            sender: self.my_id.clone(),
            body: m.body,
        };
        if m.to.contains(&self.my_id) {
            trace!(kind = ?envelope.body.kind(), "loopback");
            self.inbox.push_back(envelope.clone());
        }
        let remote = m.to.without(&self.my_id);
        if !remote.is_empty() {
            self.outbox.push(Outgoing {
                to: remote,
                envelope,
            });
        }
    }
}
