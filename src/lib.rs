// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements the coordination layer of _epoch-based
 * reconfiguration_: the protocol by which a replicated service is moved
 * from one group of hosts to another, created, or deleted, without losing
 * its state and without trusting any single coordinator to stay alive.
 *
 * The design has three load-bearing ideas:
 *
 *   - Each service lives in numbered _epochs_; an epoch change stops the
 *     old group, hands its final state to the new group, starts the new
 *     group, and garbage-collects the old state, strictly in that order.
 *
 *   - The only durable truth about a change in progress is a
 *     consensus-committed [`ReconfigurationRecord`]. Every in-memory
 *     wait-task can be killed at any moment and rebuilt from the record
 *     ([`Reconfigurator::recover`]); conversely a task that notices the
 *     record has moved past it simply cancels itself, which is what makes
 *     concurrent initiators and primary failover safe.
 *
 *   - Nothing here does I/O. Tasks and dispatchers are explicit state
 *     machines driven by an [`Executor`] that accepts envelopes and a
 *     logical clock, and returns the messages to ship. The embedding
 *     owns sockets, threads, and persistence, behind the [`Env`] traits.
 *
 * The crate is generic over the node-identity type [`NodeId`], which can
 * be anything orderable, hashable and serializable; tests use `String`.
 *
 * ## Name
 *
 * Wikipedia:
 *
 * > An interregnum is a period of discontinuity or "gap" in a government,
 * > organization, or social order.
 *
 * Here, the (carefully managed) gap between one epoch of a service and
 * the next.
 */

mod active;
mod commit;
mod drop_epoch;
mod env;
mod executor;
mod final_state;
mod message;
mod node;
mod primary;
mod record;
mod reconfigurator;
mod start_epoch;
mod stop_epoch;
mod task;

pub use active::ActiveReplica;
pub use commit::CommitWait;
pub use drop_epoch::DropEpochWait;
pub use env::{AppCoordinator, Env, RecordStore};
pub use executor::{Dispatch, Dispatcher, Executor, ExecutorError, Outgoing};
pub use final_state::EpochFinalStateWait;
pub use message::{
    AckDropEpochFinalState, AckStartEpoch, AckStopEpoch, ActiveReplicas, CreateConfirmation,
    CreateServiceName, DeleteServiceName, DemandReport, DropEpochFinalState, Envelope,
    EpochFinalState, Outbound, Packet, PacketType, RequestActiveReplicas, RequestEpochFinalState,
    StartEpoch, StopEpoch,
};
pub use node::{majority, Group, NodeId};
pub use primary::PrimaryExecutionWait;
pub use record::{ReconfigurationRecord, RecordRequest, RecordState, RequestKind};
pub use reconfigurator::Reconfigurator;
pub use start_epoch::StartEpochWait;
pub use stop_epoch::StopEpochWait;
pub use task::{
    task_key, Completion, ProtocolTask, Quorum, Restart, TaskError, DEFAULT_RESTART_PERIOD,
};

#[cfg(test)]
mod tests;
