// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The seams between this crate and its host process.
 *
 * Everything durable or application-specific sits behind three traits:
 *
 *   - [`RecordStore`] is the consensus-replicated record table. `commit`
 *     is assumed to be linearized across the reconfigurator group; this
 *     crate treats a `false` return as "retry later or give up", never as
 *     corruption.
 *
 *   - [`AppCoordinator`] is the replicated application itself: the thing
 *     that can stop a local replica, checkpoint it, retain and serve its
 *     final state, and start a replica of the next epoch from a state
 *     blob.
 *
 *   - [`Env`] glues the two together and adds the small amount of
 *     topology knowledge (who the reconfigurators are, where a new
 *     service should be placed) that dispatchers need.
 *
 * Tasks and dispatchers depend on these traits only; tests drive the
 * whole protocol against in-memory implementations.
 */
use crate::record::{ReconfigurationRecord, RecordRequest};
use crate::{Group, NodeId};

/// Access to the durable, consensus-replicated record table.
pub trait RecordStore<N: NodeId> {
    /// The current record for a service, if one exists.
    fn record(&self, service_name: &str) -> Option<ReconfigurationRecord<N>>;

    /// Commit a request through consensus. Returns whether the request
    /// took effect on the record (a stale or invalid request commits as a
    /// no-op and returns false). A creation intent (empty previous group)
    /// for an unknown service inserts a fresh
    /// [`ReconfigurationRecord::create`] record; a record left
    /// [deletable](ReconfigurationRecord::is_deletable) by a request is
    /// removed, freeing the name for re-creation.
    fn commit(&mut self, req: &RecordRequest<N>) -> bool;

    /// All records, for crash recovery.
    fn records(&self) -> Vec<ReconfigurationRecord<N>>;
}

/// The replicated application hosted on an active-replica node.
pub trait AppCoordinator<N: NodeId> {
    /// Epoch of the locally hosted replica group, if any.
    fn current_epoch(&self, service_name: &str) -> Option<u64>;

    /// Start a local replica of `epoch` from `state` (None for a fresh
    /// creation). Returns false if the group could not be created, e.g.
    /// because a newer epoch is already running.
    fn create_replica_group(
        &mut self,
        service_name: &str,
        epoch: u64,
        state: Option<&str>,
        group: &Group<N>,
    ) -> bool;

    /// Stop the local replica of `epoch`. Idempotent; returns false only
    /// if a different epoch is running.
    fn stop_replica_group(&mut self, service_name: &str, epoch: u64) -> bool;

    /// Checkpoint the stopped replica of `epoch`, retaining its final
    /// state for transfer until [`Self::delete_final_state`].
    fn checkpoint(&mut self, service_name: &str, epoch: u64) -> bool;

    /// Retained final state of a stopped epoch, if this node still holds
    /// it.
    fn final_state(&self, service_name: &str, epoch: u64) -> Option<String>;

    /// Garbage-collect the retained final state of a stopped epoch.
    fn delete_final_state(&mut self, service_name: &str, epoch: u64);
}

/// Everything a task or dispatcher needs from its host.
pub trait Env<N: NodeId>: RecordStore<N> + AppCoordinator<N> {
    /// The reconfigurator group itself (record-request fan-out targets).
    fn reconfigurators(&self) -> Group<N>;

    /// Initial placement for a service being created.
    fn placement(&self, service_name: &str) -> Group<N>;

    /// Given an aggregate demand report, propose a better group, or None
    /// to leave the service where it is.
    fn suggest_group(&mut self, _service_name: &str, _demand: u64) -> Option<Group<N>> {
        None
    }
}
