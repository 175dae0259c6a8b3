// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * Wire-level vocabulary of the reconfiguration protocol. Every message is a
 * variant of [`Packet`]; the byte-level codec is left to the embedding (all
 * packets are serde-serializable, so any codec will do).
 *
 * Packets travel inside an [`Envelope`] carrying the sender and an optional
 * correlation key. The key is stamped by the [`Executor`](crate::Executor)
 * on outbound messages so that acknowledgments can be routed back to the
 * exact task awaiting them at the recipient; responders echo the key of the
 * request they are answering.
 */
use crate::record::RecordRequest;
use crate::{Group, NodeId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The command at the center of the protocol: move `service_name` from
/// `prev_group` (epoch-1) to `cur_group` (epoch). An empty `prev_group`
/// means this is a creation epoch; an empty `cur_group` means deletion.
///
/// `prev_group_name`/`prev_epoch` usually just name the previous epoch of
/// the same service, but differ for merge operations, where the state being
/// stopped and folded in belongs to another (dissolving) service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartEpoch<N: NodeId> {
    pub service_name: String,
    pub epoch: u64,
    pub cur_group: Group<N>,
    pub prev_group: Group<N>,
    pub initiator: N,
    /// Client return-address, present only for creation epochs.
    pub creator: Option<N>,
    pub prev_group_name: String,
    pub prev_epoch: u64,
    pub is_merge: bool,
    pub is_split: bool,
    /// Whether stopping the previous epoch must also hand back its final
    /// state. False for creations and deletions, where there is nothing to
    /// transfer.
    pub requires_final_state: bool,
    /// Initial state for creation epochs, or the folded-in final state of a
    /// mergee once the merge's stop phase has retrieved it.
    pub initial_state: Option<String>,
    /// Hint: the previous-epoch member that acknowledged the stop, and so is
    /// known to hold the final state. New-group members try it first when
    /// pulling state.
    pub first_prev_candidate: Option<N>,
}

impl<N: NodeId> StartEpoch<N> {
    pub fn new(
        initiator: N,
        service_name: &str,
        epoch: u64,
        cur_group: Group<N>,
        prev_group: Group<N>,
    ) -> Self {
        let requires_final_state = !prev_group.is_empty() && !cur_group.is_empty();
        StartEpoch {
            service_name: service_name.to_string(),
            epoch,
            cur_group,
            prev_group,
            initiator,
            creator: None,
            prev_group_name: service_name.to_string(),
            prev_epoch: epoch.saturating_sub(1),
            is_merge: false,
            is_split: false,
            requires_final_state,
            initial_state: None,
            first_prev_candidate: None,
        }
    }

    pub fn with_creator(mut self, creator: N) -> Self {
        self.creator = Some(creator);
        self
    }

    pub fn with_initial_state(mut self, state: String) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Mark this epoch change as a merge folding in the final state of
    /// `prev_name` at `prev_epoch` (a different, dissolving service).
    pub fn merged_from(mut self, prev_name: &str, prev_epoch: u64) -> Self {
        self.is_merge = true;
        self.prev_group_name = prev_name.to_string();
        self.prev_epoch = prev_epoch;
        self.requires_final_state = true;
        self
    }

    /// Mark this epoch change as one half of a split. The splittee group is
    /// stopped by its own reconfiguration, not by this one.
    pub fn split(mut self) -> Self {
        self.is_split = true;
        self.requires_final_state = false;
        self
    }

    /// Creation epoch: no previous group to stop.
    pub fn is_init_epoch(&self) -> bool {
        self.prev_group.is_empty()
    }

    /// Deletion: no next group to start.
    pub fn is_deletion(&self) -> bool {
        self.cur_group.is_empty() && !self.is_merge
    }
}

impl<N: NodeId> fmt::Display for StartEpoch<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}[{}=>{}]",
            self.service_name,
            self.epoch,
            self.prev_group
                .iter()
                .format_with(",", |n, g| g(&format_args!("{:?}", n))),
            self.cur_group
                .iter()
                .format_with(",", |n, g| g(&format_args!("{:?}", n)))
        )
    }
}

/// Quiesce `service_name` at `epoch` and, when `get_final_state`, hand back
/// its serialized final state in the acknowledgment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopEpoch {
    pub service_name: String,
    pub epoch: u64,
    pub get_final_state: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckStopEpoch {
    pub service_name: String,
    pub epoch: u64,
    pub final_state: Option<String>,
}

/// Pull-based state-transfer request, issued independently by each new-group
/// member. Distinct from [`StopEpoch`]'s push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEpochFinalState {
    pub service_name: String,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochFinalState {
    pub service_name: String,
    pub epoch: u64,
    pub state: String,
}

/// Confirmation that a new-group member has installed the new epoch's state
/// and is ready to serve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckStartEpoch {
    pub service_name: String,
    pub epoch: u64,
}

/// Instruction to garbage-collect a superseded epoch's retained final state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DropEpochFinalState {
    pub service_name: String,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckDropEpochFinalState {
    pub service_name: String,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceName<N: NodeId> {
    pub service_name: String,
    pub initial_state: Option<String>,
    pub creator: N,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteServiceName {
    pub service_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestActiveReplicas {
    pub service_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveReplicas<N: NodeId> {
    pub service_name: String,
    pub epoch: u64,
    pub group: Group<N>,
}

/// Load report from an active replica. What to do about demand is not
/// decided here; the environment is consulted for a placement suggestion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemandReport {
    pub service_name: String,
    pub demand: u64,
}

/// Sent directly to a creation epoch's client once the service is live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateConfirmation {
    pub service_name: String,
    pub epoch: u64,
}

/// Tag identifying a packet variant, used for handler registration and
/// task event-type declarations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PacketType {
    StartEpoch,
    StopEpoch,
    AckStopEpoch,
    RequestEpochFinalState,
    EpochFinalState,
    AckStartEpoch,
    DropEpochFinalState,
    AckDropEpochFinalState,
    RcRecordRequest,
    CreateServiceName,
    DeleteServiceName,
    RequestActiveReplicas,
    ActiveReplicas,
    DemandReport,
    CreateConfirmation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Packet<N: NodeId> {
    StartEpoch(StartEpoch<N>),
    StopEpoch(StopEpoch),
    AckStopEpoch(AckStopEpoch),
    RequestEpochFinalState(RequestEpochFinalState),
    EpochFinalState(EpochFinalState),
    AckStartEpoch(AckStartEpoch),
    DropEpochFinalState(DropEpochFinalState),
    AckDropEpochFinalState(AckDropEpochFinalState),
    RcRecordRequest(RecordRequest<N>),
    CreateServiceName(CreateServiceName<N>),
    DeleteServiceName(DeleteServiceName),
    RequestActiveReplicas(RequestActiveReplicas),
    ActiveReplicas(ActiveReplicas<N>),
    DemandReport(DemandReport),
    CreateConfirmation(CreateConfirmation),
}

impl<N: NodeId> Packet<N> {
    pub fn kind(&self) -> PacketType {
        match self {
            Packet::StartEpoch(_) => PacketType::StartEpoch,
            Packet::StopEpoch(_) => PacketType::StopEpoch,
            Packet::AckStopEpoch(_) => PacketType::AckStopEpoch,
            Packet::RequestEpochFinalState(_) => PacketType::RequestEpochFinalState,
            Packet::EpochFinalState(_) => PacketType::EpochFinalState,
            Packet::AckStartEpoch(_) => PacketType::AckStartEpoch,
            Packet::DropEpochFinalState(_) => PacketType::DropEpochFinalState,
            Packet::AckDropEpochFinalState(_) => PacketType::AckDropEpochFinalState,
            Packet::RcRecordRequest(_) => PacketType::RcRecordRequest,
            Packet::CreateServiceName(_) => PacketType::CreateServiceName,
            Packet::DeleteServiceName(_) => PacketType::DeleteServiceName,
            Packet::RequestActiveReplicas(_) => PacketType::RequestActiveReplicas,
            Packet::ActiveReplicas(_) => PacketType::ActiveReplicas,
            Packet::DemandReport(_) => PacketType::DemandReport,
            Packet::CreateConfirmation(_) => PacketType::CreateConfirmation,
        }
    }
}

/// A packet in flight: sender plus the correlation key matching it to a
/// waiting task at the recipient, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<N: NodeId> {
    pub key: Option<String>,
    pub sender: N,
    pub body: Packet<N>,
}

/// An outbound message as produced by a task or handler: a destination set
/// plus a packet. `key` is normally left `None` and stamped with the
/// producing task's key by the executor; it is set explicitly when a reply
/// must correlate with a *different* task than the one sending it.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound<N: NodeId> {
    pub to: Group<N>,
    pub key: Option<String>,
    pub body: Packet<N>,
}

impl<N: NodeId> Outbound<N> {
    pub fn to_one(to: N, body: Packet<N>) -> Self {
        Outbound {
            to: Group::unit(to),
            key: None,
            body,
        }
    }

    pub fn broadcast(to: Group<N>, body: Packet<N>) -> Self {
        Outbound {
            to,
            key: None,
            body,
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }
}
