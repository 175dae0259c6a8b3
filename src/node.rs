// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/// A `NodeId` identifies a cluster member. This is anything Ord+Clone but
/// probably ought to be something small, like an integer or UUID or string.
/// Something that identifies a node, and something you don't mind
/// transmitting sets of, serialized, in messages.
use std::fmt::Debug;
use std::hash::Hash;

pub trait NodeId: Ord + Clone + Debug + Hash + 'static {}
impl<T: Ord + Clone + Debug + Hash + 'static> NodeId for T {}

/// A replica group for one epoch of one service: the set of nodes hosting
/// (or previously hosting) the service's replicated state. Groups get cloned
/// into every task that refers to them, so we use a cheaply-clonable shared
/// set rather than `std::collections::BTreeSet`.
pub type Group<N> = im::OrdSet<N>;

/// Majority size for a group of `n` members.
pub fn majority(n: usize) -> usize {
    (n / 2) + 1
}
