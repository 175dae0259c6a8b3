// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The protocol-task framework: the [`ProtocolTask`] trait that every
 * wait-for-acks state machine implements, the [`Quorum`] acknowledgment
 * tracker they share, and the small value types ([`Restart`],
 * [`Completion`]) that let tasks steer the [`Executor`](crate::Executor)
 * without calling back into it.
 *
 * A task is a passive value: the executor calls [`ProtocolTask::start`]
 * once, routes matching envelopes to [`ProtocolTask::handle_event`],
 * periodically calls [`ProtocolTask::restart`], and when enough events
 * have arrived calls [`ProtocolTask::handle_threshold_event`] exactly
 * once and retires the task. All sends happen by returning
 * [`Outbound`] values; a task never touches a socket.
 */
use crate::message::{Envelope, Outbound, PacketType};
use crate::{Env, Group, NodeId};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::time::Duration;

/// Default restart period for tasks that don't override
/// [`ProtocolTask::period`].
pub const DEFAULT_RESTART_PERIOD: Duration = Duration::from_secs(1);

/// Construction errors for [`Quorum`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    /// A wait-task over zero targets can never finish; constructing one
    /// is a caller bug, not a runtime condition.
    #[error("task has an empty target set")]
    EmptyTargetSet,
    #[error("threshold {required} unsatisfiable over group of {size}")]
    BadThreshold { required: usize, size: usize },
}

/// What a task wants done after a periodic restart.
pub enum Restart<N: NodeId> {
    /// Keep waiting; send these (usually a re-probe or re-broadcast).
    Resend(Vec<Outbound<N>>),
    /// The task is obviated or has given up; retire it without running
    /// its threshold action.
    Cancel,
    /// The task's goal was reached out-of-band (e.g. a deferred commit
    /// finally succeeded); run its threshold action and retire it.
    Finish,
}

/// What a retiring task leaves behind: messages to send and successor
/// tasks to spawn.
pub struct Completion<N: NodeId, E: Env<N>> {
    pub messages: Vec<Outbound<N>>,
    pub spawn: Vec<Box<dyn ProtocolTask<N, E>>>,
}

impl<N: NodeId, E: Env<N>> Completion<N, E> {
    pub fn none() -> Self {
        Completion {
            messages: Vec::new(),
            spawn: Vec::new(),
        }
    }

    pub fn send(messages: Vec<Outbound<N>>) -> Self {
        Completion {
            messages,
            spawn: Vec::new(),
        }
    }

    pub fn spawn(task: Box<dyn ProtocolTask<N, E>>) -> Self {
        Completion {
            messages: Vec::new(),
            spawn: vec![task],
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
}

/// A keyed, restartable wait-for-events state machine.
pub trait ProtocolTask<N: NodeId, E: Env<N>> {
    /// Stable key identifying this task instance; doubles as the
    /// correlation key stamped on its outgoing messages.
    fn key(&self) -> &str;

    /// Key under which the executor registers the task at spawn. The
    /// default reuses [`Self::key`]; tasks that may legitimately run
    /// several concurrent instances override this to disambiguate.
    fn refresh_key(&mut self) -> String {
        self.key().to_string()
    }

    /// The packet types this task consumes. The executor only routes an
    /// envelope to a task whose event set contains its type.
    fn event_types(&self) -> &'static [PacketType];

    /// Restart period; the executor re-calls [`Self::restart`] at this
    /// cadence until the task retires.
    fn period(&self) -> Duration {
        DEFAULT_RESTART_PERIOD
    }

    /// Called once when the task is spawned.
    fn start(&mut self, env: &mut E) -> Vec<Outbound<N>>;

    /// Called periodically while the task is live. The default re-runs
    /// [`Self::start`].
    fn restart(&mut self, env: &mut E) -> Restart<N> {
        Restart::Resend(self.start(env))
    }

    /// Consume one envelope; return whether it counted as progress.
    fn handle_event(&mut self, env: &mut E, msg: &Envelope<N>) -> bool;

    /// Whether enough progress has accumulated to retire.
    fn threshold_reached(&self) -> bool {
        false
    }

    /// Fallback routing predicate for envelopes carrying a key this
    /// executor has no task for. Only tasks shadowing another node's
    /// execution opt in.
    fn matches(&self, _msg: &Envelope<N>) -> bool {
        false
    }

    /// Run exactly once when the task retires via [`Self::threshold_reached`] or
    /// [`Restart::Finish`].
    fn handle_threshold_event(&mut self, _env: &mut E) -> Completion<N, E> {
        Completion::none()
    }
}

/// Acknowledgment tracker shared by all wait-tasks: a target set, a
/// threshold, the set of distinct ackers so far, and a cursor for tasks
/// that probe targets one at a time.
#[derive(Clone, Debug)]
pub struct Quorum<N: NodeId> {
    group: Group<N>,
    targets: Vec<N>,
    threshold: usize,
    ackers: BTreeSet<N>,
    cursor: usize,
}

impl<N: NodeId> Quorum<N> {
    pub fn new(group: &Group<N>, threshold: usize) -> Result<Self, TaskError> {
        if group.is_empty() {
            return Err(TaskError::EmptyTargetSet);
        }
        if threshold == 0 || threshold > group.len() {
            return Err(TaskError::BadThreshold {
                required: threshold,
                size: group.len(),
            });
        }
        Ok(Quorum {
            group: group.clone(),
            targets: group.iter().cloned().collect(),
            threshold,
            ackers: BTreeSet::new(),
            cursor: 0,
        })
    }

    pub fn majority_of(group: &Group<N>) -> Result<Self, TaskError> {
        Quorum::new(group, crate::majority(group.len()))
    }

    /// Move `n` to the front of the probe order, if it is a member.
    /// Pull-style tasks use this to try themselves (or a hinted node)
    /// before bothering the rest of the group.
    pub fn prefer(mut self, n: &N) -> Self {
        if let Some(pos) = self.targets.iter().position(|t| t == n) {
            let front = self.targets.remove(pos);
            self.targets.insert(0, front);
        }
        self
    }

    /// Record an acknowledgment. Returns true only for a member not seen
    /// before, so duplicates never inflate the count.
    pub fn record(&mut self, n: &N) -> bool {
        self.group.contains(n) && self.ackers.insert(n.clone())
    }

    pub fn reached(&self) -> bool {
        self.ackers.len() >= self.threshold
    }

    pub fn group(&self) -> &Group<N> {
        &self.group
    }

    pub fn ackers(&self) -> &BTreeSet<N> {
        &self.ackers
    }

    pub fn acked(&self, n: &N) -> bool {
        self.ackers.contains(n)
    }

    /// Current probe target.
    pub fn current(&self) -> &N {
        &self.targets[self.cursor % self.targets.len()]
    }

    /// Advance to the next probe target, round-robin.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.targets.len();
    }
}

/// Correlation key for a task instance: task name, owning node, service
/// and epoch. One live instance per key per executor.
pub fn task_key(task: &str, my_id: &impl Debug, service_name: &str, epoch: u64) -> String {
    format!("{}:{:?}:{}:{}", task, my_id, service_name, epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(names: &[&str]) -> Group<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quorum_rejects_empty_and_bad_thresholds() {
        assert_eq!(
            Quorum::<String>::new(&Group::new(), 1).unwrap_err(),
            TaskError::EmptyTargetSet
        );
        assert_eq!(
            Quorum::new(&group(&["a", "b"]), 3).unwrap_err(),
            TaskError::BadThreshold {
                required: 3,
                size: 2
            }
        );
        assert_eq!(
            Quorum::new(&group(&["a", "b"]), 0).unwrap_err(),
            TaskError::BadThreshold {
                required: 0,
                size: 2
            }
        );
    }

    #[test]
    fn quorum_counts_distinct_members_only() {
        let mut q = Quorum::majority_of(&group(&["a", "b", "c"])).unwrap();
        assert!(q.record(&"a".to_string()));
        assert!(!q.record(&"a".to_string()));
        assert!(!q.record(&"z".to_string()));
        assert!(!q.reached());
        assert!(q.record(&"c".to_string()));
        assert!(q.reached());
    }

    #[test]
    fn prefer_reorders_probes() {
        let mut q = Quorum::new(&group(&["a", "b", "c"]), 1)
            .unwrap()
            .prefer(&"b".to_string());
        assert_eq!(q.current(), "b");
        q.advance();
        assert_eq!(q.current(), "a");
        q.advance();
        assert_eq!(q.current(), "c");
        q.advance();
        assert_eq!(q.current(), "b");
    }

    #[test]
    fn prefer_ignores_nonmembers() {
        let q = Quorum::new(&group(&["a", "b"]), 1)
            .unwrap()
            .prefer(&"z".to_string());
        assert_eq!(q.current(), "a");
    }
}
