// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Distributed object reference counting for the core worker.
//!
//! Tracks local ref counts, submitted-task ref counts, lineage ref counts,
//! ownership, borrows, containment between ids, and object locations. An
//! object's value may be released once its total ref count reaches zero;
//! the record itself is erased once its lineage is no longer needed.
//!
//! A single mutex serializes the whole table. User callbacks (out-of-scope,
//! delete, lineage-released, shutdown hook) are invoked with that mutex
//! held and must not call back into the counter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use orbit_common::constants::REF_COUNT_WARN_INTERVAL_MS;
use orbit_common::id::{NodeID, ObjectID, WorkerID};
use orbit_common::status::Error;
use orbit_proto::rpc::{
    pub_message, sub_message, Address, ChannelType, CoreWorkerStats, ObjectRefInfo,
    ObjectReference, ObjectReferenceCount, PubMessage, SubMessage, TaskStatus, TensorTransport,
    WorkerObjectLocationsPubMessage, WorkerRefRemovedPubMessage, WorkerRefRemovedSubMessage,
};
use orbit_pubsub::{MessagePublishedCallback, Publisher, PublisherFailedCallback, Subscriber};
use orbit_util::warn_every_ms;

use crate::reference::{OutOfScopeCallback, Reference};
pub use crate::reference::ObjectRefDeleteCallback;

/// Asks the cluster whether a node is still alive.
pub type NodeAliveChecker = Box<dyn Fn(&NodeID) -> bool + Send + Sync>;

/// Invoked when an owned object's lineage is released. Returns the task's
/// argument ids (so their lineage ref counts can be decremented) and the
/// number of lineage bytes evicted. Invoked with the counter's mutex held;
/// must not call back into the counter.
pub type LineageReleasedCallback = Box<dyn Fn(&ObjectID) -> (Vec<ObjectID>, i64) + Send + Sync>;

/// Locality information for an object, used for locality-aware scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityData {
    pub object_size: u64,
    pub nodes_containing_object: HashSet<NodeID>,
}

/// Pin/spill state of a tracked object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectPinInfo {
    pub owned_by_us: bool,
    pub pinned_at: Option<NodeID>,
    pub spilled: bool,
}

/// Everything guarded by the counter's mutex.
struct State {
    object_id_refs: HashMap<ObjectID, Reference>,
    /// Owned objects in registration order, for oldest-first lineage
    /// eviction. The sequence numbers are monotonic, so iteration order is
    /// insertion order and removal by id is a map lookup away.
    reconstructable_owned_objects: BTreeMap<u64, ObjectID>,
    reconstructable_owned_objects_index: HashMap<ObjectID, u64>,
    next_reconstructable_seq: u64,
    /// Ids explicitly freed by the application while still in scope.
    freed_objects: HashSet<ObjectID>,
    /// Ids whose primary copy was lost and that should be reconstructed.
    objects_to_recover: Vec<ObjectID>,
    num_objects_owned_by_us: usize,
    num_actors_owned_by_us: usize,
    shutdown_hook: Option<Box<dyn FnOnce() + Send>>,
    on_lineage_released: Option<LineageReleasedCallback>,
}

impl State {
    fn new() -> Self {
        Self {
            object_id_refs: HashMap::new(),
            reconstructable_owned_objects: BTreeMap::new(),
            reconstructable_owned_objects_index: HashMap::new(),
            next_reconstructable_seq: 0,
            freed_objects: HashSet::new(),
            objects_to_recover: Vec::new(),
            num_objects_owned_by_us: 0,
            num_actors_owned_by_us: 0,
            shutdown_hook: None,
            on_lineage_released: None,
        }
    }

    fn remove_reconstructable(&mut self, object_id: &ObjectID) {
        if let Some(seq) = self.reconstructable_owned_objects_index.remove(object_id) {
            self.reconstructable_owned_objects.remove(&seq);
        }
    }

    fn shutdown_if_needed(&mut self) {
        if self.shutdown_hook.is_some() && self.object_id_refs.is_empty() {
            tracing::warn!("All object references have gone out of scope, shutting down worker");
            if let Some(hook) = self.shutdown_hook.take() {
                hook();
            }
        }
    }
}

/// The per-worker reference counter.
///
/// All public methods run synchronously on the calling thread and take the
/// internal mutex for their full duration. Subscribe/publish calls on the
/// pub/sub collaborator are non-blocking enqueues, so they are safe to make
/// while the mutex is held.
pub struct ReferenceCounter {
    rpc_address: Address,
    lineage_pinning_enabled: bool,
    check_node_alive: NodeAliveChecker,
    object_info_publisher: Arc<dyn Publisher>,
    object_info_subscriber: Arc<dyn Subscriber>,
    state: Mutex<State>,
    /// Handle to ourselves for building subscription callbacks.
    weak_self: Weak<ReferenceCounter>,
}

impl ReferenceCounter {
    pub fn new(
        rpc_address: Address,
        object_info_publisher: Arc<dyn Publisher>,
        object_info_subscriber: Arc<dyn Subscriber>,
        check_node_alive: NodeAliveChecker,
        lineage_pinning_enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            rpc_address,
            lineage_pinning_enabled,
            check_node_alive,
            object_info_publisher,
            object_info_subscriber,
            state: Mutex::new(State::new()),
            weak_self: weak_self.clone(),
        })
    }

    // ─── Table queries ──────────────────────────────────────────────────────

    /// Number of object ids currently tracked.
    pub fn size(&self) -> usize {
        self.state.lock().object_id_refs.len()
    }

    /// Same as [`size`](Self::size); the table holds exactly the in-scope ids.
    pub fn num_object_ids_in_scope(&self) -> usize {
        self.size()
    }

    pub fn has_reference(&self, object_id: &ObjectID) -> bool {
        self.state.lock().object_id_refs.contains_key(object_id)
    }

    pub fn owned_by_us(&self, object_id: &ObjectID) -> bool {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .is_some_and(|r| r.owned_by_us)
    }

    /// Whether the id is known to this worker. The owner address itself may
    /// still be unlearned.
    pub fn has_owner(&self, object_id: &ObjectID) -> bool {
        self.has_reference(object_id)
    }

    pub fn get_owner(&self, object_id: &ObjectID) -> Option<Address> {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .and_then(|r| r.owner_address.clone())
    }

    /// Owner addresses for a batch of ids. Unknown ids yield a default
    /// address and a warning; out-of-band ids cannot be resolved.
    pub fn get_owner_addresses(&self, object_ids: &[ObjectID]) -> Vec<Address> {
        let state = self.state.lock();
        object_ids
            .iter()
            .map(|object_id| {
                match state
                    .object_id_refs
                    .get(object_id)
                    .and_then(|r| r.owner_address.clone())
                {
                    Some(addr) => addr,
                    None => {
                        tracing::warn!(
                            "Object id {object_id} has no known owner. Ids created out of band \
                             cannot be resolved to an owner."
                        );
                        Address::default()
                    }
                }
            })
            .collect()
    }

    pub fn num_objects_owned_by_us(&self) -> usize {
        self.state.lock().num_objects_owned_by_us
    }

    pub fn num_actors_owned_by_us(&self) -> usize {
        self.state.lock().num_actors_owned_by_us
    }

    pub fn get_all_in_scope_object_ids(&self) -> HashSet<ObjectID> {
        self.state.lock().object_id_refs.keys().copied().collect()
    }

    /// (local ref count, submitted task ref count) for every tracked id.
    pub fn get_all_reference_counts(&self) -> HashMap<ObjectID, (usize, usize)> {
        self.state
            .lock()
            .object_id_refs
            .iter()
            .map(|(id, r)| (*id, (r.local_ref_count, r.submitted_task_ref_count)))
            .collect()
    }

    pub fn get_tensor_transport(&self, object_id: &ObjectID) -> Option<TensorTransport> {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .map(|r| r.tensor_transport)
    }

    pub fn debug_string(&self) -> String {
        let state = self.state.lock();
        let mut out = format!("ReferenceTable{{size: {}", state.object_id_refs.len());
        if let Some((id, r)) = state.object_id_refs.iter().next() {
            out.push_str(&format!(" sample: {}:{}", id, r.debug_string()));
        }
        out.push('}');
        out
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Invoke `shutdown` once the table drains. If it is already empty the
    /// hook runs immediately.
    pub fn drain_and_shutdown(&self, shutdown: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        if state.object_id_refs.is_empty() {
            shutdown();
        } else {
            tracing::warn!(
                "This worker is still managing {} objects, waiting for them to go out of \
                 scope before shutting down.",
                state.object_id_refs.len()
            );
            state.shutdown_hook = Some(shutdown);
        }
    }

    // ─── Local count engine ─────────────────────────────────────────────────

    /// Add a local reference. Creates the record (owner unknown) if absent;
    /// ownership must be added later via [`add_borrowed_object`](Self::add_borrowed_object).
    pub fn add_local_reference(&self, object_id: &ObjectID, call_site: &str) {
        if object_id.is_nil() {
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let reference = state
            .object_id_refs
            .entry(*object_id)
            .or_insert_with(|| Reference::with_call_site(call_site, -1));
        let was_in_use = reference.ref_count() > 0;
        reference.local_ref_count += 1;
        let now_in_use = reference.ref_count() > 0;
        tracing::debug!("Add local reference {object_id}");
        if !was_in_use && now_in_use {
            Self::set_nested_ref_in_use_recursive(state, object_id);
        }
    }

    /// Remove a local reference. Ids that reach `should_delete` during the
    /// call are appended to `deleted` so the caller can evict their values.
    pub fn remove_local_reference(&self, object_id: &ObjectID, deleted: &mut Vec<ObjectID>) {
        if object_id.is_nil() {
            return;
        }
        let mut guard = self.state.lock();
        self.remove_local_reference_internal(&mut guard, object_id, deleted);
    }

    /// Release local refs that are still held, silently skipping ids that
    /// were already released. Used for unconsumed-result cleanup.
    pub fn try_release_local_refs(&self, object_ids: &[ObjectID], deleted: &mut Vec<ObjectID>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for object_id in object_ids {
            let Some(reference) = state.object_id_refs.get(object_id) else {
                continue;
            };
            if reference.local_ref_count == 0 {
                continue;
            }
            self.remove_local_reference_internal(state, object_id, deleted);
        }
    }

    /// Drain every local ref count to zero. Used at worker shutdown.
    pub fn release_all_local_references(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut refs_to_remove = Vec::new();
        for (object_id, reference) in &state.object_id_refs {
            for _ in 0..reference.local_ref_count {
                refs_to_remove.push(*object_id);
            }
        }
        let mut deleted = Vec::new();
        for object_id in refs_to_remove {
            self.remove_local_reference_internal(state, &object_id, &mut deleted);
        }
    }

    fn remove_local_reference_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        deleted: &mut Vec<ObjectID>,
    ) {
        assert!(!object_id.is_nil());
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            warn_every_ms!(
                REF_COUNT_WARN_INTERVAL_MS,
                "Tried to decrease ref count for nonexistent object id: {}",
                object_id
            );
            return;
        };
        if reference.local_ref_count == 0 {
            warn_every_ms!(
                REF_COUNT_WARN_INTERVAL_MS,
                "Tried to decrease ref count for object id with count 0: {}. This should \
                 only happen if the object was freed explicitly.",
                object_id
            );
            return;
        }
        reference.local_ref_count -= 1;
        tracing::debug!("Remove local reference {object_id}");
        if reference.ref_count() == 0 {
            self.delete_reference_internal(state, object_id, deleted);
        }
    }

    /// Account for a newly submitted task: its return ids become pending,
    /// each added argument id gains a submitted-task ref and a lineage ref,
    /// and inlined arguments (which will never run remotely) are released.
    pub fn update_submitted_task_references(
        &self,
        return_ids: &[ObjectID],
        argument_ids_to_add: &[ObjectID],
        argument_ids_to_remove: &[ObjectID],
        deleted: &mut Vec<ObjectID>,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for return_id in return_ids {
            self.update_object_pending_creation_internal(state, return_id, true);
        }
        for argument_id in argument_ids_to_add {
            tracing::debug!("Increment ref count for submitted task argument {argument_id}");
            // The record may be missing if a large argument was passed by
            // reference without the application ever holding a local handle.
            let reference = state
                .object_id_refs
                .entry(*argument_id)
                .or_insert_with(Reference::new);
            let was_in_use = reference.ref_count() > 0;
            reference.submitted_task_ref_count += 1;
            // The lineage ref is released once the task finishes and cannot
            // be retried again.
            reference.lineage_ref_count += 1;
            let now_in_use = reference.ref_count() > 0;
            if !was_in_use && now_in_use {
                Self::set_nested_ref_in_use_recursive(state, argument_id);
            }
        }
        self.remove_submitted_task_references(state, argument_ids_to_remove, true, deleted);
    }

    /// Account for a task resubmission. Only the submitted-task ref is
    /// re-incremented; the lineage ref was never released.
    pub fn update_resubmitted_task_references(&self, argument_ids: &[ObjectID]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for argument_id in argument_ids {
            let reference = state
                .object_id_refs
                .get_mut(argument_id)
                .unwrap_or_else(|| panic!("resubmitted task argument {argument_id} unknown"));
            let was_in_use = reference.ref_count() > 0;
            reference.submitted_task_ref_count += 1;
            let now_in_use = reference.ref_count() > 0;
            if !was_in_use && now_in_use {
                Self::set_nested_ref_in_use_recursive(state, argument_id);
            }
        }
    }

    /// Account for a finished task. The callee's borrowed-refs report is
    /// merged before any ref counts are decremented so borrow state
    /// transferred for serialized ids cannot be lost when the caller's
    /// submitted-task ref drops to zero.
    pub fn update_finished_task_references(
        &self,
        return_ids: &[ObjectID],
        argument_ids: &[ObjectID],
        release_lineage: bool,
        worker_addr: &Address,
        borrowed_refs: &[ObjectReferenceCount],
        deleted: &mut Vec<ObjectID>,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for return_id in return_ids {
            self.update_object_pending_creation_internal(state, return_id, false);
        }
        let refs = reference_table_from_proto(borrowed_refs);
        if !refs.is_empty() {
            assert!(
                !WorkerID::from_binary(&worker_addr.worker_id).is_nil(),
                "borrowed-refs report carries a nil worker id"
            );
        }
        for argument_id in argument_ids {
            self.merge_remote_borrowers(state, argument_id, worker_addr, &refs);
        }
        self.remove_submitted_task_references(state, argument_ids, release_lineage, deleted);
    }

    fn remove_submitted_task_references(
        &self,
        state: &mut State,
        argument_ids: &[ObjectID],
        release_lineage: bool,
        deleted: &mut Vec<ObjectID>,
    ) {
        for argument_id in argument_ids {
            tracing::debug!("Releasing ref for submitted task argument {argument_id}");
            let Some(reference) = state.object_id_refs.get_mut(argument_id) else {
                tracing::warn!(
                    "Tried to decrease ref count for nonexistent object id: {argument_id}"
                );
                continue;
            };
            assert!(
                reference.submitted_task_ref_count > 0,
                "submitted task ref underflow for {argument_id}"
            );
            reference.submitted_task_ref_count -= 1;
            if release_lineage && reference.lineage_ref_count > 0 {
                reference.lineage_ref_count -= 1;
            }
            if reference.ref_count() == 0 {
                self.delete_reference_internal(state, argument_id, deleted);
            }
        }
    }

    // ─── Nesting/containment engine ─────────────────────────────────────────

    /// Record that `object_id` is borrowed from `owner_address`, optionally
    /// nested inside `outer_id` (pass nil for a top-level borrow).
    pub fn add_borrowed_object(
        &self,
        object_id: &ObjectID,
        outer_id: &ObjectID,
        owner_address: &Address,
        foreign_owner_already_monitoring: bool,
    ) -> bool {
        let mut guard = self.state.lock();
        self.add_borrowed_object_internal(
            &mut guard,
            object_id,
            outer_id,
            owner_address,
            foreign_owner_already_monitoring,
        )
    }

    fn add_borrowed_object_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        outer_id: &ObjectID,
        owner_address: &Address,
        foreign_owner_already_monitoring: bool,
    ) -> bool {
        if !state.object_id_refs.contains_key(object_id) {
            state.object_id_refs.insert(*object_id, Reference::new());
        }
        tracing::debug!("Adding borrowed object {object_id}");
        {
            let reference = state.object_id_refs.get_mut(object_id).unwrap();
            reference.owner_address = Some(owner_address.clone());
            reference.foreign_owner_already_monitoring |= foreign_owner_already_monitoring;
        }

        if !outer_id.is_nil() {
            let outer_known_and_borrowed = state
                .object_id_refs
                .get(outer_id)
                .is_some_and(|outer| !outer.owned_by_us);
            if outer_known_and_borrowed {
                assert_ne!(object_id, outer_id, "object cannot contain itself");
                tracing::debug!(
                    "Setting borrowed inner id {object_id} contained_in_borrowed: {outer_id}"
                );
                state
                    .object_id_refs
                    .get_mut(object_id)
                    .unwrap()
                    .nested_mut()
                    .contained_in_borrowed_ids
                    .insert(*outer_id);
                state
                    .object_id_refs
                    .get_mut(outer_id)
                    .unwrap()
                    .nested_mut()
                    .contains
                    .insert(*object_id);
                // The inner ref is in use; our borrow must be reported to
                // the object's owner.
                if state.object_id_refs.get(object_id).unwrap().ref_count() > 0 {
                    Self::set_nested_ref_in_use_recursive(state, object_id);
                }
            }
        }

        if state.object_id_refs.get(object_id).unwrap().ref_count() == 0 {
            let mut unused = Vec::new();
            self.delete_reference_internal(state, object_id, &mut unused);
        }
        true
    }

    /// Record that `object_id` (owned by `owner_address`) contains
    /// `inner_ids`. If we own the outer id the inner ids stay pinned until
    /// it goes out of scope; otherwise the outer's owner becomes a borrower
    /// of every inner id.
    pub fn add_nested_object_ids(
        &self,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &Address,
    ) {
        let mut guard = self.state.lock();
        self.add_nested_object_ids_internal(&mut guard, object_id, inner_ids, owner_address);
    }

    fn add_nested_object_ids_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &Address,
    ) {
        assert!(
            !WorkerID::from_binary(&owner_address.worker_id).is_nil(),
            "outer object owner has a nil worker id"
        );
        if owner_address.worker_id == self.rpc_address.worker_id {
            // We own the outer id. Mark the inner ids as contained so they
            // are not released until the outer id goes out of scope.
            if state.object_id_refs.contains_key(object_id) {
                {
                    let outer = state.object_id_refs.get_mut(object_id).unwrap();
                    assert!(
                        outer.owned_by_us,
                        "outer object {object_id} not owned by this worker"
                    );
                    for inner_id in inner_ids {
                        outer.nested_mut().contains.insert(*inner_id);
                        tracing::debug!(
                            "Setting inner id {inner_id} contained_in_owned: {object_id}"
                        );
                    }
                }
                // Inner records are touched in a second pass so the borrow
                // on the outer record has ended.
                for inner_id in inner_ids {
                    let (was_in_use, now_in_use) = {
                        let inner = state
                            .object_id_refs
                            .entry(*inner_id)
                            .or_insert_with(Reference::new);
                        let was_in_use = inner.ref_count() > 0;
                        inner.nested_mut().contained_in_owned.insert(*object_id);
                        (was_in_use, inner.ref_count() > 0)
                    };
                    if !was_in_use && now_in_use {
                        Self::set_nested_ref_in_use_recursive(state, inner_id);
                    }
                }
            }
        } else {
            // A remote caller owns the outer id (we returned these ids from
            // a task executed for it).
            for inner_id in inner_ids {
                tracing::debug!(
                    "Adding borrower {}:{} to object {inner_id}, borrower owns outer id \
                     {object_id}",
                    owner_address.ip_address,
                    owner_address.port
                );
                if !state.object_id_refs.contains_key(inner_id) {
                    state.object_id_refs.insert(*inner_id, Reference::new());
                }
                let owned_by_us = state.object_id_refs.get(inner_id).unwrap().owned_by_us;
                if owned_by_us {
                    let worker_id = WorkerID::from_binary(&owner_address.worker_id);
                    let inserted = state
                        .object_id_refs
                        .get_mut(inner_id)
                        .unwrap()
                        .borrow_mut()
                        .borrowers
                        .insert(worker_id, owner_address.clone())
                        .is_none();
                    if inserted {
                        // Wait for the caller to remove its reference.
                        self.wait_for_ref_removed(state, inner_id, owner_address, object_id);
                    }
                } else {
                    let inserted = state
                        .object_id_refs
                        .get_mut(inner_id)
                        .unwrap()
                        .borrow_mut()
                        .stored_in_objects
                        .insert(*object_id, owner_address.clone())
                        .is_none();
                    assert!(
                        inserted,
                        "object {inner_id} already stored inside outer id {object_id}"
                    );
                }
            }
        }
    }

    /// Walk `contained_in_borrowed_ids` edges from `inner_id` upward,
    /// marking every ancestor as having nested refs to report. Idempotent
    /// once a dirty bit is set.
    fn set_nested_ref_in_use_recursive(state: &mut State, inner_id: &ObjectID) {
        let mut pending: Vec<ObjectID> = match state.object_id_refs.get(inner_id) {
            Some(reference) => reference.contained_in_borrowed_cloned(),
            None => return,
        };
        while let Some(outer_id) = pending.pop() {
            let outer = state
                .object_id_refs
                .get_mut(&outer_id)
                .unwrap_or_else(|| panic!("containment edge to unknown outer object {outer_id}"));
            if !outer.has_nested_refs_to_report {
                outer.has_nested_refs_to_report = true;
                pending.extend(outer.contained_in_borrowed_cloned());
            }
        }
    }

    // ─── Deletion transition ────────────────────────────────────────────────

    fn delete_reference_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        deleted: &mut Vec<ObjectID>,
    ) {
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return;
        };
        tracing::debug!("Attempting to delete object {object_id}");
        if reference.ref_count() == 0 && reference.on_ref_removed {
            tracing::debug!("Replying ref-removed for object {object_id}");
            reference.on_ref_removed = false;
            self.handle_ref_removed(state, object_id);
        }

        // Re-inspect: the ref-removed reply pops borrow state for this
        // record and its children.
        let (out_of_scope, owned_by_us, contains) = {
            let Some(reference) = state.object_id_refs.get(object_id) else {
                return;
            };
            (
                reference.out_of_scope(self.lineage_pinning_enabled),
                reference.owned_by_us,
                reference.contains_ids(),
            )
        };

        // It is safe to unpin the value. Contained records finalize first.
        if out_of_scope {
            for inner_id in &contains {
                if state.object_id_refs.contains_key(inner_id) {
                    tracing::debug!("Try to delete inner object {inner_id}");
                    {
                        let inner = state.object_id_refs.get_mut(inner_id).unwrap();
                        let nested = inner.nested_mut();
                        if owned_by_us {
                            assert!(
                                nested.contained_in_owned.remove(object_id),
                                "inner object {inner_id} missing back-edge to owned outer \
                                 {object_id}"
                            );
                        } else {
                            assert!(
                                nested.contained_in_borrowed_ids.remove(object_id),
                                "inner object {inner_id} missing back-edge to borrowed outer \
                                 {object_id}"
                            );
                        }
                    }
                    self.delete_reference_internal(state, inner_id, deleted);
                }
            }
            self.on_object_out_of_scope_or_freed(state, object_id);
            deleted.push(*object_id);
            state.remove_reconstructable(object_id);
        }

        let should_delete = state
            .object_id_refs
            .get(object_id)
            .is_some_and(|r| r.should_delete(self.lineage_pinning_enabled));
        if should_delete {
            tracing::debug!("Deleting reference to object {object_id}");
            self.release_lineage_references(state, object_id);
            self.erase_reference(state, object_id);
        }
    }

    /// Fire the queued out-of-scope callbacks and clear the primary copy.
    fn on_object_out_of_scope_or_freed(&self, state: &mut State, object_id: &ObjectID) {
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return;
        };
        let callbacks = std::mem::take(&mut reference.on_object_out_of_scope_or_freed_callbacks);
        tracing::debug!(
            "Calling out-of-scope callbacks for object {object_id}, num callbacks: {}",
            callbacks.len()
        );
        for callback in &callbacks {
            callback(object_id);
        }
        let reference = state.object_id_refs.get_mut(object_id).unwrap();
        Self::unset_object_primary_copy(reference);
    }

    /// Clears primary pin and, if the object was spilled onto a known node,
    /// the spill state. Returns whether anything observable changed.
    fn unset_object_primary_copy(reference: &mut Reference) -> bool {
        let mut changed = reference.pinned_at_node_id.take().is_some();
        if reference.spilled && !reference.spilled_node_id.is_nil() {
            reference.spilled = false;
            reference.spilled_url.clear();
            reference.spilled_node_id = NodeID::nil();
            changed = true;
        }
        changed
    }

    fn erase_reference(&self, state: &mut State, object_id: &ObjectID) {
        // Publish failure so subscribers that arrive after the erase are
        // not left hanging.
        self.object_info_publisher
            .publish_failure(ChannelType::WorkerObjectLocationsChannel, &object_id.binary());

        state.remove_reconstructable(object_id);
        state.freed_objects.remove(object_id);
        let mut reference = state
            .object_id_refs
            .remove(object_id)
            .unwrap_or_else(|| panic!("erasing unknown reference {object_id}"));
        assert!(reference.should_delete(self.lineage_pinning_enabled));
        if reference.owned_by_us {
            if ObjectID::is_actor_id(object_id) {
                state.num_actors_owned_by_us -= 1;
            } else {
                state.num_objects_owned_by_us -= 1;
            }
        }
        if let Some(callback) = reference.on_object_ref_delete.take() {
            callback(object_id);
        }
        state.shutdown_if_needed();
    }

    // ─── Borrower protocol ──────────────────────────────────────────────────

    /// Serialize and hand off our borrow state for `borrowed_ids` (task
    /// arguments at task exit), then drop the artificial local ref that
    /// pinned each of them during execution.
    pub fn pop_and_clear_local_borrowers(
        &self,
        borrowed_ids: &[ObjectID],
        deleted: &mut Vec<ObjectID>,
    ) -> Vec<ObjectReferenceCount> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut borrowed_refs = HashMap::new();
        for borrowed_id in borrowed_ids {
            // `deduct_local_ref` masks the artificial local ref so it does
            // not count toward the report returned to the task's caller.
            assert!(
                Self::get_and_clear_local_borrowers_internal(
                    state,
                    borrowed_id,
                    false,
                    true,
                    &mut borrowed_refs,
                ),
                "popping borrow state for unknown object {borrowed_id}"
            );
        }
        let proto = reference_table_to_proto(borrowed_refs);

        for borrowed_id in borrowed_ids {
            tracing::debug!("Remove local reference to borrowed object {borrowed_id}");
            let Some(reference) = state.object_id_refs.get_mut(borrowed_id) else {
                warn_every_ms!(
                    REF_COUNT_WARN_INTERVAL_MS,
                    "Tried to decrease ref count for nonexistent object id: {}",
                    borrowed_id
                );
                continue;
            };
            if reference.local_ref_count == 0 {
                warn_every_ms!(
                    REF_COUNT_WARN_INTERVAL_MS,
                    "Tried to decrease ref count for object id with count 0: {}. This \
                     should only happen if the object was freed explicitly.",
                    borrowed_id
                );
            } else {
                reference.local_ref_count -= 1;
            }
            if reference.ref_count() == 0 {
                self.delete_reference_internal(state, borrowed_id, deleted);
            }
        }
        proto
    }

    fn get_and_clear_local_borrowers_internal(
        state: &mut State,
        object_id: &ObjectID,
        for_ref_removed: bool,
        deduct_local_ref: bool,
        borrowed_refs: &mut HashMap<ObjectID, ObjectReferenceCount>,
    ) -> bool {
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return false;
        };
        // It is possible to receive a reference to an object we own, e.g.
        // when executing a task whose arguments contain an id we created
        // earlier. We are authoritative for those; nothing to report.
        if reference.owned_by_us {
            return true;
        }

        if for_ref_removed || !reference.foreign_owner_already_monitoring {
            if !borrowed_refs.contains_key(object_id) {
                borrowed_refs.insert(*object_id, reference.to_proto(deduct_local_ref));
                // Hand off the accumulated borrow state; the receiver must
                // merge it until all active borrowers reach the owner. If a
                // foreign owner is already monitoring, keep the state so it
                // can still learn about the parent task's borrow.
                reference.borrow_info = None;
            }
        }
        let contains = reference.contains_ids();
        for contained_id in &contains {
            Self::get_and_clear_local_borrowers_internal(
                state,
                contained_id,
                for_ref_removed,
                false,
                borrowed_refs,
            );
        }
        // Our nested refs have been reported.
        if let Some(reference) = state.object_id_refs.get_mut(object_id) {
            reference.has_nested_refs_to_report = false;
        }
        true
    }

    fn merge_remote_borrowers(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        worker_addr: &Address,
        borrowed_refs: &HashMap<ObjectID, Reference>,
    ) {
        let Some(borrower_ref) = borrowed_refs.get(object_id) else {
            return;
        };
        tracing::debug!(
            "Merging ref {object_id}: {} borrowers, local: {}, stored_in_objects: {}",
            borrower_ref.borrow().map_or(0, |b| b.borrowers.len()),
            borrower_ref.local_ref_count,
            borrower_ref.borrow().map_or(0, |b| b.stored_in_objects.len())
        );

        if !state.object_id_refs.contains_key(object_id) {
            state.object_id_refs.insert(*object_id, Reference::new());
        }
        let mut new_borrowers: Vec<Address> = Vec::new();
        {
            let reference = state.object_id_refs.get_mut(object_id).unwrap();
            // The worker is still using the reference, so it is still a
            // borrower.
            if borrower_ref.ref_count() > 0 {
                let worker_id = WorkerID::from_binary(&worker_addr.worker_id);
                if reference
                    .borrow_mut()
                    .borrowers
                    .insert(worker_id, worker_addr.clone())
                    .is_none()
                {
                    tracing::debug!(
                        "Adding borrower {}:{} to object {object_id}",
                        worker_addr.ip_address,
                        worker_addr.port
                    );
                    new_borrowers.push(worker_addr.clone());
                }
            }
            // Workers that this worker passed the id on to are borrowers too.
            if let Some(borrow) = borrower_ref.borrow() {
                for nested_borrower in borrow.borrowers.values() {
                    let worker_id = WorkerID::from_binary(&nested_borrower.worker_id);
                    if reference
                        .borrow_mut()
                        .borrowers
                        .insert(worker_id, nested_borrower.clone())
                        .is_none()
                    {
                        new_borrowers.push(nested_borrower.clone());
                    }
                }
            }
        }

        // The ref was nested inside another object; copy that containment
        // into our table.
        if let Some(nested) = borrower_ref.nested() {
            for contained_in_borrowed_id in &nested.contained_in_borrowed_ids {
                let owner = borrower_ref
                    .owner_address
                    .clone()
                    .expect("borrowed-refs entry nested in an outer id is missing its owner");
                self.add_borrowed_object_internal(
                    state,
                    object_id,
                    contained_in_borrowed_id,
                    &owner,
                    false,
                );
            }
        }

        let owned_by_us = state.object_id_refs.get(object_id).unwrap().owned_by_us;
        if owned_by_us {
            // Wait for each new borrower to drop to zero before releasing
            // the value.
            for addr in &new_borrowers {
                self.wait_for_ref_removed(state, object_id, addr, &ObjectID::nil());
            }
        } else {
            // Ref counts arrived from another borrower; make sure they are
            // forwarded back to the owner.
            Self::set_nested_ref_in_use_recursive(state, object_id);
        }

        // The borrower stored this id inside another id it does not own.
        if let Some(borrow) = borrower_ref.borrow() {
            for (outer_id, outer_owner) in &borrow.stored_in_objects {
                self.add_nested_object_ids_internal(state, outer_id, &[*object_id], outer_owner);
            }
        }

        // Handle borrowers of nested objects.
        if let Some(nested) = borrower_ref.nested() {
            for inner_id in &nested.contains {
                self.merge_remote_borrowers(state, inner_id, worker_addr, borrowed_refs);
            }
        }
    }

    /// Only owners subscribe to a borrower's ref-removed channel.
    fn wait_for_ref_removed(
        &self,
        state: &State,
        object_id: &ObjectID,
        addr: &Address,
        contained_in_id: &ObjectID,
    ) {
        let reference = state
            .object_id_refs
            .get(object_id)
            .unwrap_or_else(|| panic!("waiting for ref-removed on unknown object {object_id}"));
        assert!(
            reference.owned_by_us,
            "only the owner may wait for a borrower's ref to be removed"
        );
        let owner_address = reference
            .owner_address
            .clone()
            .expect("owned reference missing its owner address");
        tracing::debug!(
            "WaitForRefRemoved object {object_id}, borrower {}:{}",
            addr.ip_address,
            addr.port
        );

        let sub_message = SubMessage {
            inner: Some(sub_message::Inner::WorkerRefRemovedMessage(
                WorkerRefRemovedSubMessage {
                    reference: Some(ObjectReference {
                        object_id: object_id.binary(),
                        owner_address: Some(owner_address),
                    }),
                    contained_in_id: contained_in_id.binary(),
                    intended_worker_id: addr.worker_id.clone(),
                    subscriber_worker_id: self.rpc_address.worker_id.clone(),
                },
            )),
        };

        let weak_self = self.weak_self.clone();
        let published_addr = addr.clone();
        let published_id = *object_id;
        let on_message: MessagePublishedCallback = Arc::new(move |msg: PubMessage| {
            let Some(counter) = weak_self.upgrade() else {
                return;
            };
            let Some(pub_message::Inner::WorkerRefRemovedMessage(reply)) = msg.inner else {
                panic!("expected a ref-removed payload on the ref-removed channel");
            };
            let new_borrower_refs = reference_table_from_proto(&reply.borrowed_refs);
            tracing::debug!("WaitForRefRemoved returned for object {published_id}");
            counter.cleanup_borrowers_on_ref_removed(
                &new_borrower_refs,
                &published_id,
                &published_addr,
            );
            assert!(counter.object_info_subscriber.unsubscribe(
                ChannelType::WorkerRefRemovedChannel,
                &published_addr,
                &published_id.binary(),
            ));
        });

        let weak_self = self.weak_self.clone();
        let failed_addr = addr.clone();
        let on_failure: PublisherFailedCallback = Arc::new(move |key_id: &[u8], _err: &Error| {
            // The borrower died; it holds nothing.
            let Some(counter) = weak_self.upgrade() else {
                return;
            };
            let object_id = ObjectID::from_binary(key_id);
            tracing::debug!("WaitForRefRemoved failed for object {object_id}");
            counter.cleanup_borrowers_on_ref_removed(&HashMap::new(), &object_id, &failed_addr);
        });

        assert!(self.object_info_subscriber.subscribe(
            sub_message,
            ChannelType::WorkerRefRemovedChannel,
            addr,
            &object_id.binary(),
            on_message,
            on_failure,
        ));
    }

    fn cleanup_borrowers_on_ref_removed(
        &self,
        new_borrower_refs: &HashMap<ObjectID, Reference>,
        object_id: &ObjectID,
        borrower_addr: &Address,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        // Merge any new borrowers the previous borrower learned of.
        self.merge_remote_borrowers(state, object_id, borrower_addr, new_borrower_refs);

        // Erase the previous borrower.
        let reference = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap_or_else(|| panic!("ref-removed reply for unknown object {object_id}"));
        let worker_id = WorkerID::from_binary(&borrower_addr.worker_id);
        assert!(
            reference.borrow_mut().borrowers.remove(&worker_id).is_some(),
            "borrower was not tracked for object {object_id}"
        );
        let mut unused = Vec::new();
        self.delete_reference_internal(state, object_id, &mut unused);
    }

    /// Handle an inbound "is this ref gone?" request from `owner_address`.
    ///
    /// If our ref count is already zero the reply publishes immediately;
    /// otherwise it is owed when the count next drains. A non-nil
    /// `contained_in_id` registers the containment so the reply waits until
    /// the outer scope ends.
    pub fn process_ref_removed_request(
        &self,
        object_id: &ObjectID,
        contained_in_id: &ObjectID,
        owner_address: &Address,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        tracing::debug!(
            "Received ref-removed request for object {object_id} contained in {contained_in_id} \
             from owner {}:{}",
            owner_address.ip_address,
            owner_address.port
        );

        if !state.object_id_refs.contains_key(object_id) {
            state.object_id_refs.insert(*object_id, Reference::new());
        }

        // If we are borrowing the id because we own an object that contains
        // it, the reply waits until the outer object goes out of scope.
        if !contained_in_id.is_nil() {
            self.add_nested_object_ids_internal(
                state,
                contained_in_id,
                &[*object_id],
                &self.rpc_address,
            );
        }

        if state.object_id_refs.get(object_id).unwrap().ref_count() == 0 {
            tracing::debug!(
                "Ref count for borrowed object {object_id} is already 0, replying immediately"
            );
            self.handle_ref_removed(state, object_id);
            let mut unused = Vec::new();
            self.delete_reference_internal(state, object_id, &mut unused);
        } else {
            let reference = state.object_id_refs.get_mut(object_id).unwrap();
            if reference.on_ref_removed {
                // A duplicate request can arrive when the owner died and
                // was re-executed. The newer request wins.
                tracing::warn!(
                    "Ref-removed reply already pending for object {object_id}. The owner task \
                     must have died and been re-executed."
                );
            }
            reference.on_ref_removed = true;
        }
    }

    /// Pop our borrow view of `object_id` and publish it on the ref-removed
    /// channel. Runs with the mutex held; publishing only enqueues.
    fn handle_ref_removed(&self, state: &mut State, object_id: &ObjectID) {
        let mut borrowed_refs = HashMap::new();
        Self::get_and_clear_local_borrowers_internal(
            state,
            object_id,
            true,
            false,
            &mut borrowed_refs,
        );
        let borrowed_refs = reference_table_to_proto(borrowed_refs);
        tracing::debug!(
            "Publishing ref-removed for object {object_id}, message has {} borrowed references",
            borrowed_refs.len()
        );
        let msg = PubMessage {
            channel_type: ChannelType::WorkerRefRemovedChannel as i32,
            key_id: object_id.binary(),
            inner: Some(pub_message::Inner::WorkerRefRemovedMessage(
                WorkerRefRemovedPubMessage { borrowed_refs },
            )),
        };
        self.object_info_publisher.publish(msg);
    }

    /// Directly add a known borrower for an object we own and subscribe to
    /// its ref-removed channel. The borrower being this worker itself is a
    /// caller bug.
    pub fn add_borrower_address(&self, object_id: &ObjectID, borrower_address: &Address) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        assert!(
            state.object_id_refs.contains_key(object_id),
            "adding a borrower for unknown object {object_id}"
        );
        assert!(
            state.object_id_refs.get(object_id).unwrap().owned_by_us,
            "borrowers may only be added to owned objects"
        );
        assert_ne!(
            borrower_address.worker_id, self.rpc_address.worker_id,
            "the borrower cannot be the owner itself"
        );
        tracing::debug!(
            "Add borrower {}:{} for object {object_id}",
            borrower_address.ip_address,
            borrower_address.port
        );
        let worker_id = WorkerID::from_binary(&borrower_address.worker_id);
        let inserted = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap()
            .borrow_mut()
            .borrowers
            .insert(worker_id, borrower_address.clone())
            .is_none();
        if inserted {
            self.wait_for_ref_removed(state, object_id, borrower_address, &ObjectID::nil());
        }
    }

    // ─── Ownership registration ─────────────────────────────────────────────

    /// Register an object created by this worker. Must be the first
    /// registration of `object_id`; duplicates are a caller bug.
    #[allow(clippy::too_many_arguments)]
    pub fn add_owned_object(
        &self,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &Address,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        add_local_ref: bool,
        pinned_at_node_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) {
        let mut guard = self.state.lock();
        assert!(
            self.add_owned_object_internal(
                &mut guard,
                object_id,
                inner_ids,
                owner_address,
                call_site,
                object_size,
                is_reconstructable,
                add_local_ref,
                pinned_at_node_id,
                tensor_transport,
            ),
            "Tried to create an owned object that already exists: {object_id}"
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn add_owned_object_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        inner_ids: &[ObjectID],
        owner_address: &Address,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        add_local_ref: bool,
        pinned_at_node_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) -> bool {
        if state.object_id_refs.contains_key(object_id) {
            return false;
        }
        if ObjectID::is_actor_id(object_id) {
            state.num_actors_owned_by_us += 1;
        } else {
            state.num_objects_owned_by_us += 1;
        }
        tracing::debug!("Adding owned object {object_id}");
        // The local ref count starts at zero: the return handle is created
        // by the application layer, which increments separately.
        state.object_id_refs.insert(
            *object_id,
            Reference::owned(
                owner_address.clone(),
                call_site,
                object_size,
                is_reconstructable,
                pinned_at_node_id,
                tensor_transport,
            ),
        );
        if !inner_ids.is_empty() {
            // The inner ids stay pinned until the outer id goes out of scope.
            self.add_nested_object_ids_internal(state, object_id, inner_ids, &self.rpc_address);
        }
        if let Some(node_id) = pinned_at_node_id {
            // Eagerly record the pinned node as a known location.
            self.add_object_location_internal(state, object_id, &node_id);
        }

        let seq = state.next_reconstructable_seq;
        state.next_reconstructable_seq += 1;
        state.reconstructable_owned_objects.insert(seq, *object_id);
        assert!(state
            .reconstructable_owned_objects_index
            .insert(*object_id, seq)
            .is_none());

        if add_local_ref {
            state.object_id_refs.get_mut(object_id).unwrap().local_ref_count += 1;
        }
        true
    }

    /// Register an extra return generated by a task that already completed.
    /// The return inherits the generator's owner, call site, and
    /// reconstructability, and stays pinned until the generator is gone. A
    /// generator that already left the table makes this a no-op.
    pub fn add_dynamic_return(&self, object_id: &ObjectID, generator_id: &ObjectID) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(outer) = state.object_id_refs.get(generator_id) else {
            // The generator went out of scope: either the return was never
            // deserialized, or it was already registered.
            return;
        };
        assert!(outer.owned_by_us);
        let owner_address = outer
            .owner_address
            .clone()
            .expect("owned generator missing its owner address");
        let call_site = outer.call_site.clone();
        let is_reconstructable = outer.is_reconstructable;
        tracing::debug!(
            "Adding dynamic return {object_id} contained in generator object {generator_id}"
        );
        let _ = self.add_owned_object_internal(
            state,
            object_id,
            &[],
            &owner_address,
            &call_site,
            -1,
            is_reconstructable,
            false,
            None,
            TensorTransport::ObjectStore,
        );
        self.add_nested_object_ids_internal(state, generator_id, &[*object_id], &owner_address);
    }

    /// Like [`add_dynamic_return`](Self::add_dynamic_return) for streamed
    /// returns: holds a local ref on the new id (released by the stream
    /// manager) and does not nest it. The stream layer keeps the generator
    /// alive while the stream exists.
    pub fn own_dynamic_streaming_task_return_ref(
        &self,
        object_id: &ObjectID,
        generator_id: &ObjectID,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(outer) = state.object_id_refs.get(generator_id) else {
            tracing::debug!(
                "Ignoring streamed return {object_id} registered after generator {generator_id} \
                 went out of scope"
            );
            return;
        };
        assert!(outer.owned_by_us);
        let owner_address = outer
            .owner_address
            .clone()
            .expect("owned generator missing its owner address");
        let call_site = outer.call_site.clone();
        let is_reconstructable = outer.is_reconstructable;
        tracing::debug!(
            "Adding streamed dynamic return {object_id} from generator object {generator_id}"
        );
        let _ = self.add_owned_object_internal(
            state,
            object_id,
            &[],
            &owner_address,
            &call_site,
            -1,
            is_reconstructable,
            true,
            None,
            TensorTransport::ObjectStore,
        );
    }

    /// True iff the generator id and all `num_objects_generated` streamed
    /// return ids are gone from the table.
    pub fn check_generator_refs_lineage_out_of_scope(
        &self,
        generator_id: &ObjectID,
        num_objects_generated: i64,
    ) -> bool {
        let state = self.state.lock();
        if state.object_id_refs.contains_key(generator_id) {
            return false;
        }
        let task_id = generator_id.task_id();
        for i in 0..num_objects_generated {
            // Task returns start from index 1 and the first return is the
            // generator id itself, hence the offset of 2.
            let return_id = ObjectID::from_index(&task_id, (i + 2) as u32);
            if state.object_id_refs.contains_key(&return_id) {
                return false;
            }
        }
        true
    }

    // ─── Lineage surface ────────────────────────────────────────────────────

    /// Install the callback invoked when an owned object's lineage is
    /// released. May only be installed once.
    pub fn set_release_lineage_callback(&self, callback: LineageReleasedCallback) {
        let mut state = self.state.lock();
        assert!(
            state.on_lineage_released.is_none(),
            "lineage-released callback installed twice"
        );
        state.on_lineage_released = Some(callback);
    }

    /// Release lineage for the oldest reconstructable owned objects until at
    /// least `min_bytes_to_evict` bytes have been reported or none remain.
    /// Returns the bytes evicted.
    pub fn evict_lineage(&self, min_bytes_to_evict: i64) -> i64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut lineage_bytes_evicted = 0;
        while lineage_bytes_evicted < min_bytes_to_evict {
            let Some((&seq, &object_id)) = state.reconstructable_owned_objects.first_key_value()
            else {
                break;
            };
            state.reconstructable_owned_objects.remove(&seq);
            state.reconstructable_owned_objects_index.remove(&object_id);
            assert!(
                state.object_id_refs.contains_key(&object_id),
                "reconstructable queue entry {object_id} missing from the table"
            );
            lineage_bytes_evicted += self.release_lineage_references(state, &object_id);
        }
        lineage_bytes_evicted
    }

    fn release_lineage_references(&self, state: &mut State, object_id: &ObjectID) -> i64 {
        let mut lineage_bytes_evicted = 0;
        let mut argument_ids = Vec::new();
        let owned_by_us = state
            .object_id_refs
            .get(object_id)
            .is_some_and(|r| r.owned_by_us);
        if owned_by_us && state.on_lineage_released.is_some() {
            tracing::debug!("Releasing lineage for object {object_id}");
            let (arguments, bytes) =
                (state.on_lineage_released.as_ref().unwrap())(object_id);
            argument_ids = arguments;
            lineage_bytes_evicted += bytes;
            // Still in scope and reconstructable: mark the lineage evicted
            // so reconstruction can return the right error.
            let reference = state.object_id_refs.get_mut(object_id).unwrap();
            if !reference.out_of_scope(self.lineage_pinning_enabled)
                && reference.is_reconstructable
            {
                reference.lineage_evicted = true;
                reference.is_reconstructable = false;
            }
        }

        for argument_id in &argument_ids {
            {
                let Some(argument) = state.object_id_refs.get_mut(argument_id) else {
                    continue;
                };
                if argument.lineage_ref_count == 0 {
                    continue;
                }
                tracing::debug!("Releasing lineage for argument {argument_id}");
                argument.lineage_ref_count -= 1;
            }
            let out_of_scope = state
                .object_id_refs
                .get(argument_id)
                .unwrap()
                .out_of_scope(self.lineage_pinning_enabled);
            if out_of_scope {
                self.on_object_out_of_scope_or_freed(state, argument_id);
            }
            let should_delete = state
                .object_id_refs
                .get(argument_id)
                .is_some_and(|r| r.should_delete(self.lineage_pinning_enabled));
            if should_delete {
                assert!(!state.object_id_refs.get(argument_id).unwrap().on_ref_removed);
                lineage_bytes_evicted += self.release_lineage_references(state, argument_id);
                self.erase_reference(state, argument_id);
            }
        }
        lineage_bytes_evicted
    }

    /// Whether the object can still be reconstructed, and whether its
    /// lineage was evicted. (false, false) when lineage pinning is off or
    /// the id is unknown.
    pub fn is_object_reconstructable(&self, object_id: &ObjectID) -> (bool, bool) {
        if !self.lineage_pinning_enabled {
            return (false, false);
        }
        let state = self.state.lock();
        match state.object_id_refs.get(object_id) {
            Some(r) => (r.is_reconstructable, r.lineage_evicted),
            None => (false, false),
        }
    }

    // ─── Freed objects ──────────────────────────────────────────────────────

    /// Release the stored values for `object_ids` while keeping the records
    /// for ownership tracking.
    pub fn free_stored_objects(&self, object_ids: &[ObjectID]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for object_id in object_ids {
            if !state.object_id_refs.contains_key(object_id) {
                tracing::warn!("Tried to free an object {object_id} that is already out of scope");
                continue;
            }
            // Removed from this set once the record itself is deleted.
            state.freed_objects.insert(*object_id);
            if !state.object_id_refs.get(object_id).unwrap().owned_by_us {
                tracing::warn!(
                    "Tried to free an object {object_id} that we did not create. The object \
                     value may not be released."
                );
                continue;
            }
            // Free only the stored value; the record keeps the ownership
            // information.
            self.on_object_out_of_scope_or_freed(state, object_id);
        }
    }

    pub fn is_stored_object_freed(&self, object_id: &ObjectID) -> bool {
        self.state.lock().freed_objects.contains(object_id)
    }

    /// Reverse an explicit free after the application re-deserialized the
    /// same id. Pinning was cleared and must be re-supplied.
    pub fn try_mark_freed_object_in_use_again(&self, object_id: &ObjectID) -> bool {
        let mut state = self.state.lock();
        if !state.object_id_refs.contains_key(object_id) {
            return false;
        }
        state.freed_objects.remove(object_id)
    }

    // ─── Location & pinning surface ─────────────────────────────────────────

    /// Handle the loss of a node: clear primary-copy and spill state that
    /// lived there, queue still-in-scope objects for recovery, and drop the
    /// node from every location set.
    pub fn reset_objects_on_removed_node(&self, node_id: &NodeID) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let object_ids: Vec<ObjectID> = state.object_id_refs.keys().copied().collect();
        for object_id in object_ids {
            let (primary_lost, changed) = {
                let reference = state.object_id_refs.get_mut(&object_id).unwrap();
                let primary_lost = reference.pinned_at_node_id == Some(*node_id)
                    || reference.spilled_node_id == *node_id;
                let mut changed = false;
                if primary_lost {
                    changed |= Self::unset_object_primary_copy(reference);
                }
                changed |= reference.locations.remove(node_id);
                (primary_lost, changed)
            };
            if primary_lost {
                let in_scope = !state
                    .object_id_refs
                    .get(&object_id)
                    .unwrap()
                    .out_of_scope(self.lineage_pinning_enabled);
                if in_scope {
                    state.objects_to_recover.push(object_id);
                }
            }
            if changed {
                self.push_to_location_subscribers(state, &object_id);
            }
        }
    }

    /// Drain the queue of objects whose primary copy was lost.
    pub fn flush_objects_to_recover(&self) -> Vec<ObjectID> {
        std::mem::take(&mut self.state.lock().objects_to_recover)
    }

    /// Record where the object's primary copy is pinned. Only meaningful
    /// for owned ids that are in scope and not freed. A dead node clears
    /// the primary copy and queues the object for recovery instead.
    pub fn update_object_pinned_at_node(&self, object_id: &ObjectID, node_id: &NodeID) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.object_id_refs.contains_key(object_id) {
            return;
        }
        if state.freed_objects.contains(object_id) {
            // Freed by the application.
            return;
        }
        {
            let reference = state.object_id_refs.get(object_id).unwrap();
            if let Some(existing) = reference.pinned_at_node_id {
                tracing::info!(
                    "Updating primary location for object {object_id} to node {node_id}, but it \
                     already has a primary location {existing}. This should only happen during \
                     reconstruction."
                );
            }
            // Only the owner tracks the primary location.
            assert!(reference.owned_by_us);
        }
        let out_of_scope = state
            .object_id_refs
            .get(object_id)
            .unwrap()
            .out_of_scope(self.lineage_pinning_enabled);
        if !out_of_scope {
            if (self.check_node_alive)(node_id) {
                let changed = {
                    let reference = state.object_id_refs.get_mut(object_id).unwrap();
                    let mut changed = reference.pinned_at_node_id != Some(*node_id);
                    reference.pinned_at_node_id = Some(*node_id);
                    changed |= reference.locations.insert(*node_id);
                    changed
                };
                if changed {
                    self.push_to_location_subscribers(state, object_id);
                }
            } else {
                let changed = {
                    let reference = state.object_id_refs.get_mut(object_id).unwrap();
                    Self::unset_object_primary_copy(reference)
                };
                state.objects_to_recover.push(*object_id);
                if changed {
                    self.push_to_location_subscribers(state, object_id);
                }
            }
        }
    }

    /// Pin/spill state. `None` if the id is unknown.
    pub fn is_object_pinned_or_spilled(&self, object_id: &ObjectID) -> Option<ObjectPinInfo> {
        let state = self.state.lock();
        state.object_id_refs.get(object_id).map(|r| {
            if r.owned_by_us {
                ObjectPinInfo {
                    owned_by_us: true,
                    pinned_at: r.pinned_at_node_id,
                    spilled: r.spilled,
                }
            } else {
                ObjectPinInfo::default()
            }
        })
    }

    /// Record a spill of the object's primary copy. Returns whether the
    /// spill was recorded.
    pub fn handle_object_spilled(
        &self,
        object_id: &ObjectID,
        spilled_url: &str,
        spilled_node_id: &NodeID,
    ) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            tracing::warn!("Spilled object {object_id} already out of scope");
            return false;
        };
        if reference.out_of_scope(self.lineage_pinning_enabled) && !spilled_node_id.is_nil() {
            // An out-of-scope object spilled by its primary node has already
            // had its eviction notification sent; the spilled copy is gone.
            return false;
        }

        reference.spilled = true;
        reference.did_spill = true;
        let spilled_location_alive =
            spilled_node_id.is_nil() || (self.check_node_alive)(spilled_node_id);
        if spilled_location_alive {
            if !spilled_url.is_empty() {
                reference.spilled_url = spilled_url.to_string();
            }
            if !spilled_node_id.is_nil() {
                reference.spilled_node_id = *spilled_node_id;
            }
            self.push_to_location_subscribers(state, object_id);
        } else {
            tracing::debug!("Object {object_id} spilled to dead node {spilled_node_id}");
            Self::unset_object_primary_copy(reference);
            state.objects_to_recover.push(*object_id);
        }
        true
    }

    /// Add a node to the object's location set. Returns whether the id was
    /// known.
    pub fn add_object_location(&self, object_id: &ObjectID, node_id: &NodeID) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.object_id_refs.contains_key(object_id) {
            tracing::debug!(
                "Tried to add a location for object {object_id} that is not in the reference \
                 table; it may already be evicted."
            );
            return false;
        }
        self.add_object_location_internal(state, object_id, node_id);
        true
    }

    fn add_object_location_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        node_id: &NodeID,
    ) {
        tracing::debug!("Adding location {node_id} for object {object_id}");
        let inserted = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap()
            .locations
            .insert(*node_id);
        // The pinned location is added eagerly, so the object-store
        // notification may arrive for a node we already know about.
        if inserted {
            self.push_to_location_subscribers(state, object_id);
        }
    }

    /// Remove a node from the object's location set. Returns whether the id
    /// was known.
    pub fn remove_object_location(&self, object_id: &ObjectID, node_id: &NodeID) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        tracing::debug!("Removing location {node_id} for object {object_id}");
        if !state.object_id_refs.contains_key(object_id) {
            tracing::debug!(
                "Tried to remove a location for object {object_id} that is not in the reference \
                 table; it may already be evicted."
            );
            return false;
        }
        let removed = state
            .object_id_refs
            .get_mut(object_id)
            .unwrap()
            .locations
            .remove(node_id);
        if removed {
            self.push_to_location_subscribers(state, object_id);
        }
        true
    }

    pub fn get_object_locations(&self, object_id: &ObjectID) -> Option<HashSet<NodeID>> {
        let state = self.state.lock();
        state
            .object_id_refs
            .get(object_id)
            .map(|r| r.locations.clone())
    }

    /// Record the object's size once known, notifying location subscribers.
    pub fn update_object_size(&self, object_id: &ObjectID, object_size: i64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return;
        };
        if reference.object_size != object_size {
            reference.object_size = object_size;
            self.push_to_location_subscribers(state, object_id);
        }
    }

    pub fn update_object_pending_creation(&self, object_id: &ObjectID, pending_creation: bool) {
        let mut guard = self.state.lock();
        self.update_object_pending_creation_internal(&mut guard, object_id, pending_creation);
    }

    fn update_object_pending_creation_internal(
        &self,
        state: &mut State,
        object_id: &ObjectID,
        pending_creation: bool,
    ) {
        let mut push = false;
        if let Some(reference) = state.object_id_refs.get_mut(object_id) {
            push = reference.pending_creation != pending_creation;
            reference.pending_creation = pending_creation;
        }
        if push {
            self.push_to_location_subscribers(state, object_id);
        }
    }

    pub fn is_object_pending_creation(&self, object_id: &ObjectID) -> bool {
        self.state
            .lock()
            .object_id_refs
            .get(object_id)
            .is_some_and(|r| r.pending_creation)
    }

    /// Locality data for scheduling. `None` while the size or the record is
    /// unknown.
    pub fn get_locality_data(&self, object_id: &ObjectID) -> Option<LocalityData> {
        let state = self.state.lock();
        let reference = state.object_id_refs.get(object_id)?;
        if reference.object_size < 0 {
            tracing::debug!(
                "Reference [{}] for object {object_id} has an unknown size, locality data not \
                 available",
                reference.call_site
            );
            return None;
        }
        // For owned objects this is the complete up-to-date location set;
        // for borrowed objects it is a snapshot.
        let mut node_ids = reference.locations.clone();
        // The primary copy always holds the object, in memory or spilled.
        if let Some(primary) = reference.pinned_at_node_id {
            node_ids.insert(primary);
        }
        Some(LocalityData {
            object_size: reference.object_size as u64,
            nodes_containing_object: node_ids,
        })
    }

    /// Merge locality information resolved for a borrowed reference.
    pub fn report_locality_data(
        &self,
        object_id: &ObjectID,
        locations: &HashSet<NodeID>,
        object_size: u64,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            tracing::debug!(
                "Tried to report locality data for object {object_id} that is not in the \
                 reference table; it has probably been freed."
            );
            return false;
        };
        assert!(
            !reference.owned_by_us,
            "locality reports apply only to borrowed references"
        );
        for location in locations {
            reference.locations.insert(*location);
        }
        if object_size > 0 {
            reference.object_size = object_size as i64;
        }
        true
    }

    // ─── Location publication ───────────────────────────────────────────────

    fn push_to_location_subscribers(&self, state: &State, object_id: &ObjectID) {
        let Some(reference) = state.object_id_refs.get(object_id) else {
            return;
        };
        tracing::debug!(
            "Publishing locations for object {object_id}: {} locations, spilled url [{}], \
             pending creation: {}",
            reference.locations.len(),
            reference.spilled_url,
            reference.pending_creation
        );
        let msg = PubMessage {
            channel_type: ChannelType::WorkerObjectLocationsChannel as i32,
            key_id: object_id.binary(),
            inner: Some(pub_message::Inner::WorkerObjectLocationsMessage(
                Self::fill_object_information_internal(reference),
            )),
        };
        self.object_info_publisher.publish(msg);
    }

    fn fill_object_information_internal(reference: &Reference) -> WorkerObjectLocationsPubMessage {
        WorkerObjectLocationsPubMessage {
            node_ids: reference.locations.iter().map(|n| n.binary()).collect(),
            object_size: if reference.object_size > 0 {
                reference.object_size
            } else {
                0
            },
            spilled_url: reference.spilled_url.clone(),
            spilled_node_id: reference.spilled_node_id.binary(),
            primary_node_id: reference
                .pinned_at_node_id
                .unwrap_or_else(NodeID::nil)
                .binary(),
            pending_creation: reference.pending_creation,
            did_spill: reference.did_spill,
            ref_removed: false,
        }
    }

    /// Current location snapshot, or a `ref_removed` marker if the record
    /// is gone.
    pub fn fill_object_information(&self, object_id: &ObjectID) -> WorkerObjectLocationsPubMessage {
        let state = self.state.lock();
        match state.object_id_refs.get(object_id) {
            Some(reference) => Self::fill_object_information_internal(reference),
            None => {
                tracing::warn!(
                    "Object locations requested for {object_id}, but the ref was already \
                     removed. This may be a bug in the distributed reference counting protocol."
                );
                WorkerObjectLocationsPubMessage {
                    ref_removed: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Unconditionally publish one location snapshot, so a first-time
    /// subscriber receives the current state.
    pub fn publish_object_location_snapshot(&self, object_id: &ObjectID) {
        let guard = self.state.lock();
        let state = &*guard;
        if !state.object_id_refs.contains_key(object_id) {
            tracing::warn!(
                "Object locations requested for {object_id}, but the ref was already removed. \
                 This may be a bug in the distributed reference counting protocol."
            );
            // Let subscribers observe the error, then fail the key so the
            // unreachable object does not hang them.
            let msg = PubMessage {
                channel_type: ChannelType::WorkerObjectLocationsChannel as i32,
                key_id: object_id.binary(),
                inner: Some(pub_message::Inner::WorkerObjectLocationsMessage(
                    WorkerObjectLocationsPubMessage {
                        ref_removed: true,
                        ..Default::default()
                    },
                )),
            };
            self.object_info_publisher.publish(msg);
            self.object_info_publisher
                .publish_failure(ChannelType::WorkerObjectLocationsChannel, &object_id.binary());
            return;
        }
        self.push_to_location_subscribers(state, object_id);
    }

    // ─── Callbacks ──────────────────────────────────────────────────────────

    /// Install the callback fired at the record's final erase. Returns
    /// whether the id was known.
    pub fn set_object_ref_deleted_callback(
        &self,
        object_id: &ObjectID,
        callback: ObjectRefDeleteCallback,
    ) -> bool {
        let mut state = self.state.lock();
        match state.object_id_refs.get_mut(object_id) {
            Some(reference) => {
                reference.on_object_ref_delete = Some(callback);
                true
            }
            None => false,
        }
    }

    /// Queue a callback fired when the object goes out of scope or is
    /// freed. Refused for unknown ids, for records that are out of scope
    /// but still lineage-pinned (the callback might never fire), and for
    /// already-freed records (it would need to fire immediately).
    pub fn add_object_out_of_scope_or_freed_callback(
        &self,
        object_id: &ObjectID,
        callback: OutOfScopeCallback,
    ) -> bool {
        let mut state = self.state.lock();
        if state.freed_objects.contains(object_id) {
            return false;
        }
        let Some(reference) = state.object_id_refs.get_mut(object_id) else {
            return false;
        };
        if reference.out_of_scope(self.lineage_pinning_enabled)
            && !reference.should_delete(self.lineage_pinning_enabled)
        {
            return false;
        }
        reference
            .on_object_out_of_scope_or_freed_callbacks
            .push(callback);
        true
    }

    // ─── Stats ──────────────────────────────────────────────────────────────

    /// Append per-object ref info to `stats`, capped at `limit` entries
    /// (-1 for no cap). `pinned_objects` maps pinned ids to (size, call
    /// site) and fills gaps for records missing that information; pinned
    /// ids with no record at all are appended as pinned-only entries.
    pub fn add_object_ref_stats(
        &self,
        pinned_objects: &HashMap<ObjectID, (i64, String)>,
        stats: &mut CoreWorkerStats,
        limit: i64,
    ) {
        let state = self.state.lock();
        let mut total = state.object_id_refs.len() as i64;
        let mut count = 0i64;

        for (object_id, reference) in &state.object_id_refs {
            if limit != -1 && count >= limit {
                break;
            }
            count += 1;

            let mut info = ObjectRefInfo {
                object_id: object_id.binary(),
                call_site: reference.call_site.clone(),
                object_size: reference.object_size,
                local_ref_count: reference.local_ref_count as u64,
                submitted_task_ref_count: reference.submitted_task_ref_count as u64,
                ..Default::default()
            };
            if let Some((pinned_size, pinned_call_site)) = pinned_objects.get(object_id) {
                info.pinned_in_memory = true;
                // Fall back to the pinned info when the record lacks it.
                if reference.object_size <= 0 {
                    info.object_size = *pinned_size;
                }
                if reference.call_site.is_empty() {
                    info.call_site = pinned_call_site.clone();
                }
            }
            if let Some(nested) = reference.nested() {
                info.contained_in_owned =
                    nested.contained_in_owned.iter().map(|id| id.binary()).collect();
            }
            if reference.owned_by_us && !reference.pending_creation {
                // Set for finished tasks here in case the task spec was
                // already dropped by the task layer.
                info.task_status = TaskStatus::Finished as i32;
            }
            stats.object_refs.push(info);
        }

        // Pinned objects nothing references anymore.
        for (object_id, (object_size, call_site)) in pinned_objects {
            if state.object_id_refs.contains_key(object_id) {
                continue;
            }
            if limit != -1 && count >= limit {
                break;
            }
            count += 1;
            total += 1;
            stats.object_refs.push(ObjectRefInfo {
                object_id: object_id.binary(),
                call_site: call_site.clone(),
                object_size: *object_size,
                pinned_in_memory: true,
                ..Default::default()
            });
        }

        stats.objects_total = total;
    }
}

// ─── Report table conversions ───────────────────────────────────────────────

fn reference_table_from_proto(proto: &[ObjectReferenceCount]) -> HashMap<ObjectID, Reference> {
    proto
        .iter()
        .map(|entry| {
            let object_id = ObjectID::from_binary(
                &entry
                    .reference
                    .as_ref()
                    .expect("borrowed-refs entry missing its reference")
                    .object_id,
            );
            (object_id, Reference::from_proto(entry))
        })
        .collect()
}

fn reference_table_to_proto(
    table: HashMap<ObjectID, ObjectReferenceCount>,
) -> Vec<ObjectReferenceCount> {
    table
        .into_iter()
        .map(|(object_id, mut entry)| {
            entry
                .reference
                .get_or_insert_with(Default::default)
                .object_id = object_id.binary();
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex as PlMutex;

    use orbit_common::id::{ActorID, JobID, TaskID};

    #[derive(Default)]
    struct RecordingPublisher {
        messages: PlMutex<Vec<PubMessage>>,
        failures: PlMutex<Vec<Vec<u8>>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, msg: PubMessage) -> bool {
            self.messages.lock().push(msg);
            true
        }

        fn publish_failure(&self, _channel: ChannelType, key_id: &[u8]) {
            self.failures.lock().push(key_id.to_vec());
        }
    }

    impl RecordingPublisher {
        fn location_messages_for(&self, object_id: &ObjectID) -> usize {
            self.messages
                .lock()
                .iter()
                .filter(|m| {
                    m.channel_type == ChannelType::WorkerObjectLocationsChannel as i32
                        && m.key_id == object_id.binary()
                })
                .count()
        }

        fn ref_removed_messages_for(&self, object_id: &ObjectID) -> Vec<PubMessage> {
            self.messages
                .lock()
                .iter()
                .filter(|m| {
                    m.channel_type == ChannelType::WorkerRefRemovedChannel as i32
                        && m.key_id == object_id.binary()
                })
                .cloned()
                .collect()
        }
    }

    #[derive(Default)]
    struct MockSubscriber {
        subscribe_count: AtomicUsize,
    }

    impl Subscriber for MockSubscriber {
        fn subscribe(
            &self,
            _sub_message: SubMessage,
            _channel: ChannelType,
            _publisher_address: &Address,
            _key_id: &[u8],
            _on_message: MessagePublishedCallback,
            _on_failure: PublisherFailedCallback,
        ) -> bool {
            self.subscribe_count.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn unsubscribe(
            &self,
            _channel: ChannelType,
            _publisher_address: &Address,
            _key_id: &[u8],
        ) -> bool {
            true
        }
    }

    fn make_address(worker_byte: u8) -> Address {
        Address {
            node_id: vec![0u8; 28],
            ip_address: "127.0.0.1".to_string(),
            port: 4801,
            worker_id: vec![worker_byte; 28],
        }
    }

    fn object_id() -> ObjectID {
        ObjectID::from_index(&TaskID::from_random(), 2)
    }

    fn node_id(byte: u8) -> NodeID {
        NodeID::from_binary(&[byte; 28])
    }

    struct Harness {
        rc: Arc<ReferenceCounter>,
        publisher: Arc<RecordingPublisher>,
        subscriber: Arc<MockSubscriber>,
        addr: Address,
    }

    fn harness(lineage_pinning_enabled: bool) -> Harness {
        harness_with_liveness(lineage_pinning_enabled, true)
    }

    fn harness_with_liveness(lineage_pinning_enabled: bool, node_alive: bool) -> Harness {
        let publisher = Arc::new(RecordingPublisher::default());
        let subscriber = Arc::new(MockSubscriber::default());
        let addr = make_address(7);
        let rc = ReferenceCounter::new(
            addr.clone(),
            publisher.clone(),
            subscriber.clone(),
            Box::new(move |_| node_alive),
            lineage_pinning_enabled,
        );
        Harness {
            rc,
            publisher,
            subscriber,
            addr,
        }
    }

    fn add_owned(h: &Harness, id: &ObjectID, add_local_ref: bool) {
        h.rc.add_owned_object(
            id,
            &[],
            &h.addr,
            "test:1",
            -1,
            false,
            add_local_ref,
            None,
            TensorTransport::ObjectStore,
        );
    }

    fn add_owned_reconstructable(h: &Harness, id: &ObjectID) {
        h.rc.add_owned_object(
            id,
            &[],
            &h.addr,
            "test:1",
            -1,
            true,
            true,
            None,
            TensorTransport::ObjectStore,
        );
    }

    fn report_entry(id: &ObjectID, owner: &Address, has_local_ref: bool) -> ObjectReferenceCount {
        ObjectReferenceCount {
            reference: Some(ObjectReference {
                object_id: id.binary(),
                owner_address: Some(owner.clone()),
            }),
            has_local_ref,
            ..Default::default()
        }
    }

    // ─── Local count engine ─────────────────────────────────────────────────

    #[test]
    fn test_local_ref_count_conservation() {
        let h = harness(false);
        let id = object_id();
        let mut deleted = Vec::new();

        h.rc.add_local_reference(&id, "");
        h.rc.add_local_reference(&id, "");
        assert!(h.rc.has_reference(&id));
        h.rc.remove_local_reference(&id, &mut deleted);
        assert!(h.rc.has_reference(&id));
        assert!(deleted.is_empty());
        h.rc.remove_local_reference(&id, &mut deleted);
        assert!(!h.rc.has_reference(&id));
        assert_eq!(deleted, vec![id]);
        assert_eq!(h.rc.size(), 0);
    }

    #[test]
    fn test_remove_nonexistent_reference_is_tolerated() {
        let h = harness(false);
        let id = object_id();
        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&id, &mut deleted);
        assert!(deleted.is_empty());

        // Over-removal after deletion is also just a warning.
        h.rc.add_local_reference(&id, "");
        h.rc.remove_local_reference(&id, &mut deleted);
        h.rc.remove_local_reference(&id, &mut deleted);
        assert_eq!(deleted.len(), 1);
    }

    #[test]
    fn test_nil_id_is_ignored() {
        let h = harness(false);
        let mut deleted = Vec::new();
        h.rc.add_local_reference(&ObjectID::nil(), "");
        h.rc.remove_local_reference(&ObjectID::nil(), &mut deleted);
        assert_eq!(h.rc.size(), 0);
    }

    #[test]
    fn test_release_all_local_references() {
        let h = harness(false);
        let id1 = object_id();
        let id2 = object_id();
        h.rc.add_local_reference(&id1, "");
        h.rc.add_local_reference(&id1, "");
        h.rc.add_local_reference(&id2, "");
        h.rc.release_all_local_references();
        assert_eq!(h.rc.size(), 0);
    }

    #[test]
    fn test_try_release_local_refs_skips_released_ids() {
        let h = harness(false);
        let known = object_id();
        let unknown = object_id();
        h.rc.add_local_reference(&known, "");
        let mut deleted = Vec::new();
        h.rc.try_release_local_refs(&[known, unknown], &mut deleted);
        assert_eq!(deleted, vec![known]);
        // A second release is silently skipped.
        h.rc.try_release_local_refs(&[known], &mut deleted);
        assert_eq!(deleted.len(), 1);
    }

    #[test]
    fn test_submitted_task_reference_lifecycle() {
        let h = harness(true);
        let return_id = object_id();
        let arg_id = object_id();
        add_owned(&h, &return_id, false);

        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[return_id], &[arg_id], &[], &mut deleted);
        assert!(h.rc.is_object_pending_creation(&return_id));
        assert!(h.rc.has_reference(&arg_id));

        h.rc.update_finished_task_references(
            &[return_id],
            &[arg_id],
            true,
            &make_address(2),
            &[],
            &mut deleted,
        );
        assert!(!h.rc.is_object_pending_creation(&return_id));
        assert!(!h.rc.has_reference(&arg_id));
        assert_eq!(deleted, vec![arg_id]);
    }

    #[test]
    fn test_inlined_arguments_are_released_on_submission() {
        let h = harness(true);
        let arg_id = object_id();
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[arg_id], &[], &mut deleted);
        // The argument value was inlined; the task will never hold it.
        h.rc.update_submitted_task_references(&[], &[], &[arg_id], &mut deleted);
        assert!(!h.rc.has_reference(&arg_id));
    }

    #[test]
    fn test_resubmitted_task_references() {
        let h = harness(true);
        let arg_id = object_id();
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[arg_id], &[], &mut deleted);
        h.rc.update_finished_task_references(
            &[],
            &[arg_id],
            false,
            &make_address(2),
            &[],
            &mut deleted,
        );
        // The lineage ref is still held, so the record survives.
        assert!(h.rc.has_reference(&arg_id));

        h.rc.update_resubmitted_task_references(&[arg_id]);
        h.rc.update_finished_task_references(
            &[],
            &[arg_id],
            true,
            &make_address(2),
            &[],
            &mut deleted,
        );
        assert!(!h.rc.has_reference(&arg_id));
    }

    #[test]
    fn test_remove_submitted_continues_past_unknown_ids() {
        let h = harness(true);
        let unknown = object_id();
        let known = object_id();
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[known], &[], &mut deleted);
        // The unknown id warns; the known id after it is still released.
        h.rc.update_finished_task_references(
            &[],
            &[unknown, known],
            true,
            &make_address(2),
            &[],
            &mut deleted,
        );
        assert!(!h.rc.has_reference(&known));
    }

    // ─── Ownership ──────────────────────────────────────────────────────────

    #[test]
    fn test_owned_counts_partition_actors_and_objects() {
        let h = harness(false);
        let plain = object_id();
        let actor_id = ActorID::of(&JobID::from_int(1), &TaskID::nil(), 0);
        let actor_handle = ObjectID::for_actor_handle(&actor_id);

        add_owned(&h, &plain, true);
        add_owned(&h, &actor_handle, true);
        assert_eq!(h.rc.num_objects_owned_by_us(), 1);
        assert_eq!(h.rc.num_actors_owned_by_us(), 1);
        assert!(h.rc.owned_by_us(&plain));
        assert_eq!(h.rc.get_owner(&plain), Some(h.addr.clone()));

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&plain, &mut deleted);
        h.rc.remove_local_reference(&actor_handle, &mut deleted);
        assert_eq!(h.rc.num_objects_owned_by_us(), 0);
        assert_eq!(h.rc.num_actors_owned_by_us(), 0);
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn test_duplicate_owned_registration_is_fatal() {
        let h = harness(false);
        let id = object_id();
        add_owned(&h, &id, true);
        add_owned(&h, &id, true);
    }

    #[test]
    fn test_get_owner_addresses_defaults_for_unknown_ids() {
        let h = harness(false);
        let known = object_id();
        add_owned(&h, &known, true);
        let addresses = h.rc.get_owner_addresses(&[known, object_id()]);
        assert_eq!(addresses[0], h.addr);
        assert_eq!(addresses[1], Address::default());
    }

    // ─── Nesting / delete closure ───────────────────────────────────────────

    #[test]
    fn test_deleting_outer_releases_contained_inner() {
        let h = harness(false);
        let inner = object_id();
        let outer = object_id();
        add_owned(&h, &inner, false);
        h.rc.add_owned_object(
            &outer,
            &[inner],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            None,
            TensorTransport::ObjectStore,
        );
        // The inner id is held only by its containment in the outer.
        assert!(h.rc.has_reference(&inner));

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&outer, &mut deleted);
        assert!(!h.rc.has_reference(&outer));
        assert!(!h.rc.has_reference(&inner));
        assert!(deleted.contains(&outer));
        assert!(deleted.contains(&inner));
    }

    #[test]
    fn test_containment_symmetry() {
        let h = harness(false);
        let inner = object_id();
        let outer = object_id();
        add_owned(&h, &inner, false);
        h.rc.add_owned_object(
            &outer,
            &[inner],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            None,
            TensorTransport::ObjectStore,
        );

        let borrowed_outer = object_id();
        let borrowed_inner = object_id();
        let owner = make_address(3);
        h.rc.add_local_reference(&borrowed_outer, "");
        h.rc.add_borrowed_object(&borrowed_outer, &ObjectID::nil(), &owner, false);
        h.rc.add_local_reference(&borrowed_inner, "");
        h.rc.add_borrowed_object(&borrowed_inner, &borrowed_outer, &owner, false);

        let state = h.rc.state.lock();
        for (id, reference) in &state.object_id_refs {
            for contained in reference.contains_ids() {
                let inner_ref = state.object_id_refs.get(&contained).unwrap();
                let nested = inner_ref.nested().unwrap();
                if reference.owned_by_us {
                    assert!(nested.contained_in_owned.contains(id));
                    assert!(!nested.contained_in_borrowed_ids.contains(id));
                } else {
                    assert!(nested.contained_in_borrowed_ids.contains(id));
                    assert!(!nested.contained_in_owned.contains(id));
                }
            }
        }
    }

    #[test]
    fn test_no_deletable_record_survives_operations() {
        let h = harness(true);
        let a = object_id();
        let b = object_id();
        let mut deleted = Vec::new();
        add_owned(&h, &a, true);
        h.rc.update_submitted_task_references(&[], &[a, b], &[], &mut deleted);
        h.rc.update_finished_task_references(
            &[],
            &[a, b],
            true,
            &make_address(2),
            &[],
            &mut deleted,
        );
        h.rc.remove_local_reference(&a, &mut deleted);

        let state = h.rc.state.lock();
        for reference in state.object_id_refs.values() {
            assert!(!reference.should_delete(h.rc.lineage_pinning_enabled));
        }
    }

    // ─── Borrower protocol ──────────────────────────────────────────────────

    #[test]
    fn test_merge_keeps_argument_alive_via_borrower() {
        let h = harness(true);
        let id = object_id();
        add_owned(&h, &id, false);
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);

        let borrower = make_address(2);
        let report = vec![report_entry(&id, &h.addr, true)];
        // The merge lands before the submitted-task decrement, so the
        // transferred borrow keeps the record alive.
        h.rc.update_finished_task_references(&[], &[id], true, &borrower, &report, &mut deleted);
        assert!(h.rc.has_reference(&id));
        assert_eq!(h.subscriber.subscribe_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let h = harness(true);
        let id = object_id();
        add_owned(&h, &id, false);
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);

        let borrower = make_address(2);
        let report = vec![report_entry(&id, &h.addr, true)];
        h.rc.update_finished_task_references(&[], &[id], true, &borrower, &report, &mut deleted);
        h.rc.update_finished_task_references(&[], &[id], true, &borrower, &report, &mut deleted);
        // The second merge adds no new borrower and no new subscription.
        assert_eq!(h.subscriber.subscribe_count.load(Ordering::SeqCst), 1);
        assert!(h.rc.has_reference(&id));
    }

    #[test]
    fn test_pop_and_clear_masks_artificial_local_ref() {
        let h = harness(false);
        let id = object_id();
        let owner = make_address(3);
        // The runtime pins each task argument with one local ref.
        h.rc.add_local_reference(&id, "");
        h.rc.add_borrowed_object(&id, &ObjectID::nil(), &owner, false);

        let mut deleted = Vec::new();
        let report = h.rc.pop_and_clear_local_borrowers(&[id], &mut deleted);
        assert_eq!(report.len(), 1);
        assert!(!report[0].has_local_ref);
        assert_eq!(
            report[0].reference.as_ref().unwrap().object_id,
            id.binary()
        );
        // Dropping the artificial ref ends the borrow.
        assert!(!h.rc.has_reference(&id));
        assert_eq!(deleted, vec![id]);
    }

    #[test]
    fn test_pop_and_clear_reports_nested_borrows() {
        let h = harness(false);
        let outer = object_id();
        let inner = object_id();
        let owner = make_address(3);
        h.rc.add_local_reference(&outer, "");
        h.rc.add_borrowed_object(&outer, &ObjectID::nil(), &owner, false);
        // Deserializing the outer object surfaced the inner id; the
        // application keeps a handle to it.
        h.rc.add_local_reference(&inner, "");
        h.rc.add_borrowed_object(&inner, &outer, &owner, false);

        let mut deleted = Vec::new();
        let report = h.rc.pop_and_clear_local_borrowers(&[outer], &mut deleted);
        assert_eq!(report.len(), 2);
        let outer_entry = report
            .iter()
            .find(|e| e.reference.as_ref().unwrap().object_id == outer.binary())
            .unwrap();
        let inner_entry = report
            .iter()
            .find(|e| e.reference.as_ref().unwrap().object_id == inner.binary())
            .unwrap();
        assert!(outer_entry.contains.contains(&inner.binary()));
        assert!(inner_entry.has_local_ref);
        assert!(inner_entry
            .contained_in_borrowed_ids
            .contains(&outer.binary()));

        // The outer borrow ends; the inner handle is still live.
        assert!(!h.rc.has_reference(&outer));
        assert!(h.rc.has_reference(&inner));
    }

    #[test]
    fn test_nested_refs_to_report_keep_outer_alive() {
        let h = harness(false);
        let outer = object_id();
        let inner = object_id();
        let owner = make_address(3);
        h.rc.add_local_reference(&outer, "");
        h.rc.add_borrowed_object(&outer, &ObjectID::nil(), &owner, false);
        h.rc.add_local_reference(&inner, "");
        h.rc.add_borrowed_object(&inner, &outer, &owner, false);

        // The in-use inner ref must still be flushed to the owner, so the
        // outer record cannot die yet.
        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&outer, &mut deleted);
        assert!(h.rc.has_reference(&outer));

        // Reporting up clears the dirty bit and lets the outer go.
        let report = h.rc.pop_and_clear_local_borrowers(&[outer], &mut deleted);
        assert_eq!(report.len(), 2);
        assert!(!h.rc.has_reference(&outer));
        assert!(h.rc.has_reference(&inner));
    }

    #[test]
    fn test_stored_in_objects_pins_returned_inner_id() {
        let h = harness(false);
        let inner = object_id();
        let outer = object_id();
        let caller = make_address(2);
        // We return `inner` to a remote caller inside `outer`, which the
        // caller owns. We own neither.
        h.rc.add_local_reference(&inner, "");
        h.rc.add_nested_object_ids(&outer, &[inner], &caller);

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&inner, &mut deleted);
        // The stored-in edge keeps the record alive for reporting.
        assert!(h.rc.has_reference(&inner));

        let report = h.rc.pop_and_clear_local_borrowers(&[], &mut deleted);
        assert!(report.is_empty());
    }

    #[test]
    fn test_returning_owned_inner_subscribes_to_caller() {
        let h = harness(false);
        let inner = object_id();
        let outer = object_id();
        let caller = make_address(2);
        add_owned(&h, &inner, false);
        // We returned an id we own inside the caller's return object; the
        // caller becomes a borrower.
        h.rc.add_nested_object_ids(&outer, &[inner], &caller);
        assert_eq!(h.subscriber.subscribe_count.load(Ordering::SeqCst), 1);
        assert!(h.rc.has_reference(&inner));
    }

    #[test]
    fn test_ref_removed_request_replies_immediately_at_zero() {
        let h = harness(false);
        let id = object_id();
        let owner = make_address(2);
        h.rc.process_ref_removed_request(&id, &ObjectID::nil(), &owner);
        assert_eq!(h.publisher.ref_removed_messages_for(&id).len(), 1);
        assert!(!h.rc.has_reference(&id));
    }

    #[test]
    fn test_ref_removed_reply_waits_for_local_ref() {
        let h = harness(false);
        let id = object_id();
        let owner = make_address(2);
        h.rc.add_local_reference(&id, "");
        h.rc.add_borrowed_object(&id, &ObjectID::nil(), &owner, false);
        h.rc.process_ref_removed_request(&id, &ObjectID::nil(), &owner);
        assert!(h.publisher.ref_removed_messages_for(&id).is_empty());

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&id, &mut deleted);
        assert_eq!(h.publisher.ref_removed_messages_for(&id).len(), 1);
        assert!(!h.rc.has_reference(&id));
    }

    #[test]
    fn test_duplicate_ref_removed_request_is_tolerated() {
        let h = harness(false);
        let id = object_id();
        let owner = make_address(2);
        h.rc.add_local_reference(&id, "");
        h.rc.process_ref_removed_request(&id, &ObjectID::nil(), &owner);
        // Owner re-execution sends a second request; the newer one wins.
        h.rc.process_ref_removed_request(&id, &ObjectID::nil(), &owner);

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&id, &mut deleted);
        assert_eq!(h.publisher.ref_removed_messages_for(&id).len(), 1);
    }

    #[test]
    fn test_add_borrower_address_subscribes_once() {
        let h = harness(false);
        let id = object_id();
        add_owned(&h, &id, true);
        let borrower = make_address(2);
        h.rc.add_borrower_address(&id, &borrower);
        h.rc.add_borrower_address(&id, &borrower);
        assert_eq!(h.subscriber.subscribe_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "owned objects")]
    fn test_add_borrower_address_requires_ownership() {
        let h = harness(false);
        let id = object_id();
        h.rc.add_local_reference(&id, "");
        h.rc.add_borrower_address(&id, &make_address(2));
    }

    #[test]
    #[should_panic(expected = "owner itself")]
    fn test_add_borrower_address_rejects_self() {
        let h = harness(false);
        let id = object_id();
        add_owned(&h, &id, true);
        let addr = h.addr.clone();
        h.rc.add_borrower_address(&id, &addr);
    }

    // ─── Lineage ────────────────────────────────────────────────────────────

    #[test]
    fn test_lineage_eviction_during_scope() {
        let h = harness(true);
        let id = object_id();
        add_owned_reconstructable(&h, &id);
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);

        h.rc.set_release_lineage_callback(Box::new(|_| (Vec::new(), 10)));
        assert_eq!(h.rc.evict_lineage(1), 10);

        // The local ref holds the record; only reconstructability is gone.
        assert!(h.rc.has_reference(&id));
        assert_eq!(h.rc.is_object_reconstructable(&id), (false, true));
        // The id left the eviction queue.
        assert_eq!(h.rc.evict_lineage(1), 0);
    }

    #[test]
    fn test_evict_lineage_is_fifo_and_stops_at_threshold() {
        let h = harness(true);
        let a = object_id();
        let b = object_id();
        let c = object_id();
        add_owned_reconstructable(&h, &a);
        add_owned_reconstructable(&h, &b);
        add_owned_reconstructable(&h, &c);

        let released: Arc<PlMutex<Vec<ObjectID>>> = Arc::new(PlMutex::new(Vec::new()));
        let released2 = Arc::clone(&released);
        h.rc.set_release_lineage_callback(Box::new(move |id| {
            released2.lock().push(*id);
            (Vec::new(), 10)
        }));

        assert_eq!(h.rc.evict_lineage(15), 20);
        assert_eq!(released.lock().as_slice(), &[a, b]);
        assert_eq!(h.rc.evict_lineage(1), 10);
        assert_eq!(released.lock().as_slice(), &[a, b, c]);
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn test_release_lineage_callback_installed_once() {
        let h = harness(true);
        h.rc.set_release_lineage_callback(Box::new(|_| (Vec::new(), 0)));
        h.rc.set_release_lineage_callback(Box::new(|_| (Vec::new(), 0)));
    }

    #[test]
    fn test_release_lineage_decrements_upstream_arguments() {
        let h = harness(true);
        let result = object_id();
        let arg = object_id();
        add_owned_reconstructable(&h, &result);

        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[arg], &[], &mut deleted);
        h.rc.update_finished_task_references(
            &[],
            &[arg],
            false,
            &make_address(2),
            &[],
            &mut deleted,
        );
        // The argument is out of scope but lineage-pinned.
        assert!(h.rc.has_reference(&arg));

        let result_for_cb = result;
        h.rc.set_release_lineage_callback(Box::new(move |id| {
            if *id == result_for_cb {
                (vec![arg], 25)
            } else {
                (Vec::new(), 0)
            }
        }));
        assert_eq!(h.rc.evict_lineage(1), 25);
        assert!(!h.rc.has_reference(&arg));
    }

    #[test]
    fn test_lineage_pinning_disabled_deletes_out_of_scope_arguments() {
        let h = harness(false);
        let arg = object_id();
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[arg], &[], &mut deleted);
        h.rc.update_finished_task_references(
            &[],
            &[arg],
            false,
            &make_address(2),
            &[],
            &mut deleted,
        );
        // With pinning off the lineage ref does not hold the record.
        assert!(!h.rc.has_reference(&arg));
    }

    // ─── Dynamic returns ────────────────────────────────────────────────────

    #[test]
    fn test_dynamic_return_after_generator_gc_is_noop() {
        let h = harness(true);
        let generator = object_id();
        let dynamic = object_id();
        h.rc.add_dynamic_return(&dynamic, &generator);
        assert!(!h.rc.has_reference(&dynamic));
        assert_eq!(h.rc.size(), 0);
    }

    #[test]
    fn test_dynamic_return_pinned_by_generator() {
        let h = harness(false);
        let generator = object_id();
        let dynamic = object_id();
        add_owned(&h, &generator, true);
        h.rc.add_dynamic_return(&dynamic, &generator);
        assert!(h.rc.owned_by_us(&dynamic));
        assert!(h.rc.has_reference(&dynamic));

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&generator, &mut deleted);
        assert!(!h.rc.has_reference(&generator));
        assert!(!h.rc.has_reference(&dynamic));
    }

    #[test]
    fn test_streaming_return_holds_its_own_local_ref() {
        let h = harness(false);
        let generator = object_id();
        let streamed = object_id();
        add_owned(&h, &generator, true);
        h.rc.own_dynamic_streaming_task_return_ref(&streamed, &generator);

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&generator, &mut deleted);
        // Not nested in the generator; the stream layer's ref holds it.
        assert!(h.rc.has_reference(&streamed));
        h.rc.remove_local_reference(&streamed, &mut deleted);
        assert!(!h.rc.has_reference(&streamed));
    }

    #[test]
    fn test_check_generator_refs_lineage_out_of_scope() {
        let h = harness(true);
        let task_id = TaskID::from_random();
        let generator = ObjectID::from_index(&task_id, 1);
        assert!(h.rc.check_generator_refs_lineage_out_of_scope(&generator, 2));

        let streamed = ObjectID::from_index(&task_id, 2);
        h.rc.add_local_reference(&streamed, "");
        assert!(!h.rc.check_generator_refs_lineage_out_of_scope(&generator, 2));

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&streamed, &mut deleted);
        assert!(h.rc.check_generator_refs_lineage_out_of_scope(&generator, 2));
    }

    // ─── Freed objects ──────────────────────────────────────────────────────

    #[test]
    fn test_free_then_reuse() {
        let h = harness(false);
        let id = object_id();
        let node = node_id(1);
        h.rc.add_owned_object(
            &id,
            &[],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            Some(node),
            TensorTransport::ObjectStore,
        );
        assert_eq!(
            h.rc.is_object_pinned_or_spilled(&id).unwrap().pinned_at,
            Some(node)
        );

        h.rc.free_stored_objects(&[id]);
        assert!(h.rc.is_stored_object_freed(&id));
        // Freeing releases the primary copy but keeps the record.
        assert!(h.rc.has_reference(&id));
        assert_eq!(h.rc.is_object_pinned_or_spilled(&id).unwrap().pinned_at, None);

        assert!(h.rc.try_mark_freed_object_in_use_again(&id));
        assert!(!h.rc.is_stored_object_freed(&id));
        // Pinning must be re-supplied.
        h.rc.update_object_pinned_at_node(&id, &node);
        assert_eq!(
            h.rc.is_object_pinned_or_spilled(&id).unwrap().pinned_at,
            Some(node)
        );
    }

    #[test]
    fn test_free_fires_out_of_scope_callbacks() {
        let h = harness(false);
        let id = object_id();
        add_owned(&h, &id, true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        assert!(h.rc.add_object_out_of_scope_or_freed_callback(
            &id,
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
        ));
        h.rc.free_stored_objects(&[id]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // A freed record refuses further out-of-scope callbacks.
        assert!(!h.rc.add_object_out_of_scope_or_freed_callback(&id, Box::new(|_| {})));
    }

    #[test]
    fn test_free_unknown_or_borrowed_objects_warns() {
        let h = harness(false);
        let unknown = object_id();
        h.rc.free_stored_objects(&[unknown]);
        assert!(!h.rc.is_stored_object_freed(&unknown));

        let borrowed = object_id();
        h.rc.add_local_reference(&borrowed, "");
        h.rc.add_borrowed_object(&borrowed, &ObjectID::nil(), &make_address(2), false);
        h.rc.free_stored_objects(&[borrowed]);
        // Recorded as freed even though we cannot release the value.
        assert!(h.rc.is_stored_object_freed(&borrowed));
    }

    #[test]
    fn test_mark_freed_in_use_again_unknown_id() {
        let h = harness(false);
        assert!(!h.rc.try_mark_freed_object_in_use_again(&object_id()));
    }

    // ─── Deletion side effects ──────────────────────────────────────────────

    #[test]
    fn test_out_of_scope_callbacks_fire_on_deletion() {
        let h = harness(false);
        let id = object_id();
        let node = node_id(1);
        h.rc.add_owned_object(
            &id,
            &[],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            Some(node),
            TensorTransport::ObjectStore,
        );
        let out_of_scope = Arc::new(AtomicUsize::new(0));
        let deleted_cb = Arc::new(AtomicUsize::new(0));
        let out_of_scope2 = Arc::clone(&out_of_scope);
        let deleted_cb2 = Arc::clone(&deleted_cb);
        assert!(h.rc.add_object_out_of_scope_or_freed_callback(
            &id,
            Box::new(move |_| {
                out_of_scope2.fetch_add(1, Ordering::SeqCst);
            })
        ));
        assert!(h.rc.set_object_ref_deleted_callback(
            &id,
            Box::new(move |_| {
                deleted_cb2.fetch_add(1, Ordering::SeqCst);
            })
        ));

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&id, &mut deleted);
        assert_eq!(out_of_scope.load(Ordering::SeqCst), 1);
        assert_eq!(deleted_cb.load(Ordering::SeqCst), 1);
        // Deletion fails the locations key so late subscribers are not hung.
        assert!(h.publisher.failures.lock().contains(&id.binary()));
    }

    #[test]
    fn test_callback_registration_refused_for_unknown_ids() {
        let h = harness(false);
        let id = object_id();
        assert!(!h.rc.set_object_ref_deleted_callback(&id, Box::new(|_| {})));
        assert!(!h.rc.add_object_out_of_scope_or_freed_callback(&id, Box::new(|_| {})));
    }

    #[test]
    fn test_shutdown_hook_fires_when_table_drains() {
        let h = harness(false);
        let id = object_id();
        add_owned(&h, &id, true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        h.rc.drain_and_shutdown(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut deleted = Vec::new();
        h.rc.remove_local_reference(&id, &mut deleted);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_hook_fires_immediately_when_empty() {
        let h = harness(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        h.rc.drain_and_shutdown(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // ─── Locations, pinning, spilling ───────────────────────────────────────

    #[test]
    fn test_location_publications_only_on_change() {
        let h = harness(false);
        let id = object_id();
        let n1 = node_id(1);
        add_owned(&h, &id, true);
        assert_eq!(h.publisher.location_messages_for(&id), 0);

        assert!(h.rc.add_object_location(&id, &n1));
        assert_eq!(h.publisher.location_messages_for(&id), 1);
        assert!(h.rc.add_object_location(&id, &n1));
        assert_eq!(h.publisher.location_messages_for(&id), 1);

        assert!(h.rc.remove_object_location(&id, &n1));
        assert_eq!(h.publisher.location_messages_for(&id), 2);
        assert!(h.rc.remove_object_location(&id, &n1));
        assert_eq!(h.publisher.location_messages_for(&id), 2);

        h.rc.update_object_size(&id, 100);
        assert_eq!(h.publisher.location_messages_for(&id), 3);
        h.rc.update_object_size(&id, 100);
        assert_eq!(h.publisher.location_messages_for(&id), 3);

        h.rc.update_object_pending_creation(&id, true);
        assert_eq!(h.publisher.location_messages_for(&id), 4);
        h.rc.update_object_pending_creation(&id, true);
        assert_eq!(h.publisher.location_messages_for(&id), 4);

        // The snapshot publication is unconditional.
        h.rc.publish_object_location_snapshot(&id);
        assert_eq!(h.publisher.location_messages_for(&id), 5);
    }

    #[test]
    fn test_location_updates_for_unknown_ids_are_tolerated() {
        let h = harness(false);
        let id = object_id();
        assert!(!h.rc.add_object_location(&id, &node_id(1)));
        assert!(!h.rc.remove_object_location(&id, &node_id(1)));
        assert!(h.rc.get_object_locations(&id).is_none());
    }

    #[test]
    fn test_pinning_keeps_location_invariant() {
        let h = harness(false);
        let id = object_id();
        let node = node_id(1);
        add_owned(&h, &id, true);
        h.rc.update_object_pinned_at_node(&id, &node);
        // A pinned object is always among its own locations.
        assert!(h.rc.get_object_locations(&id).unwrap().contains(&node));
        let info = h.rc.is_object_pinned_or_spilled(&id).unwrap();
        assert_eq!(info.pinned_at, Some(node));
        assert!(info.owned_by_us);
    }

    #[test]
    fn test_pinning_at_dead_node_queues_recovery() {
        let h = harness_with_liveness(false, false);
        let id = object_id();
        add_owned(&h, &id, true);
        h.rc.update_object_pinned_at_node(&id, &node_id(1));
        assert_eq!(h.rc.is_object_pinned_or_spilled(&id).unwrap().pinned_at, None);
        assert_eq!(h.rc.flush_objects_to_recover(), vec![id]);
        assert!(h.rc.flush_objects_to_recover().is_empty());
    }

    #[test]
    fn test_reset_objects_on_removed_node() {
        let h = harness(false);
        let id = object_id();
        let lost = node_id(1);
        let surviving = node_id(2);
        h.rc.add_owned_object(
            &id,
            &[],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            Some(lost),
            TensorTransport::ObjectStore,
        );
        h.rc.add_object_location(&id, &surviving);

        h.rc.reset_objects_on_removed_node(&lost);
        assert_eq!(h.rc.is_object_pinned_or_spilled(&id).unwrap().pinned_at, None);
        let locations = h.rc.get_object_locations(&id).unwrap();
        assert!(!locations.contains(&lost));
        assert!(locations.contains(&surviving));
        assert_eq!(h.rc.flush_objects_to_recover(), vec![id]);
    }

    #[test]
    fn test_handle_object_spilled() {
        let h = harness(false);
        let id = object_id();
        let spill_node = node_id(1);
        add_owned(&h, &id, true);
        assert!(h.rc.handle_object_spilled(&id, "s3://bucket/key", &spill_node));
        let info = h.rc.fill_object_information(&id);
        assert_eq!(info.spilled_url, "s3://bucket/key");
        assert_eq!(info.spilled_node_id, spill_node.binary());
        assert!(info.did_spill);
        assert!(h.rc.is_object_pinned_or_spilled(&id).unwrap().spilled);

        assert!(!h.rc.handle_object_spilled(&object_id(), "s3://x", &spill_node));
    }

    #[test]
    fn test_spill_to_dead_node_queues_recovery() {
        let h = harness_with_liveness(false, false);
        let id = object_id();
        add_owned(&h, &id, true);
        assert!(h.rc.handle_object_spilled(&id, "s3://bucket/key", &node_id(1)));
        assert_eq!(h.rc.flush_objects_to_recover(), vec![id]);
    }

    #[test]
    fn test_fill_object_information_for_missing_ref() {
        let h = harness(false);
        let info = h.rc.fill_object_information(&object_id());
        assert!(info.ref_removed);
    }

    #[test]
    fn test_snapshot_for_missing_ref_publishes_failure() {
        let h = harness(false);
        let id = object_id();
        h.rc.publish_object_location_snapshot(&id);
        assert_eq!(h.publisher.location_messages_for(&id), 1);
        assert!(h.publisher.failures.lock().contains(&id.binary()));
    }

    #[test]
    fn test_locality_data() {
        let h = harness(false);
        let id = object_id();
        let node = node_id(1);
        add_owned(&h, &id, true);
        // Unknown size: no locality data.
        assert!(h.rc.get_locality_data(&id).is_none());

        h.rc.update_object_size(&id, 1024);
        h.rc.update_object_pinned_at_node(&id, &node);
        let locality = h.rc.get_locality_data(&id).unwrap();
        assert_eq!(locality.object_size, 1024);
        assert!(locality.nodes_containing_object.contains(&node));

        assert!(h.rc.get_locality_data(&object_id()).is_none());
    }

    #[test]
    fn test_report_locality_data_for_borrowed_ref() {
        let h = harness(false);
        let id = object_id();
        h.rc.add_local_reference(&id, "");
        h.rc.add_borrowed_object(&id, &ObjectID::nil(), &make_address(2), false);

        let mut locations = HashSet::new();
        locations.insert(node_id(1));
        assert!(h.rc.report_locality_data(&id, &locations, 512));
        let locality = h.rc.get_locality_data(&id).unwrap();
        assert_eq!(locality.object_size, 512);
        assert!(locality.nodes_containing_object.contains(&node_id(1)));

        assert!(!h.rc.report_locality_data(&object_id(), &locations, 1));
    }

    #[test]
    fn test_tensor_transport_recorded() {
        let h = harness(false);
        let id = object_id();
        h.rc.add_owned_object(
            &id,
            &[],
            &h.addr,
            "test:1",
            -1,
            false,
            true,
            None,
            TensorTransport::Nccl,
        );
        assert_eq!(h.rc.get_tensor_transport(&id), Some(TensorTransport::Nccl));
        assert_eq!(h.rc.get_tensor_transport(&object_id()), None);
    }

    // ─── Stats and debugging ────────────────────────────────────────────────

    #[test]
    fn test_object_ref_stats() {
        let h = harness(false);
        let tracked = object_id();
        let pinned_only = object_id();
        h.rc.add_owned_object(
            &tracked,
            &[],
            &h.addr,
            "lib.py:10",
            -1,
            false,
            true,
            None,
            TensorTransport::ObjectStore,
        );

        let mut pinned = HashMap::new();
        pinned.insert(tracked, (2048i64, "pinned.py:1".to_string()));
        pinned.insert(pinned_only, (512i64, "pinned.py:2".to_string()));

        let mut stats = CoreWorkerStats::default();
        h.rc.add_object_ref_stats(&pinned, &mut stats, -1);
        assert_eq!(stats.objects_total, 2);
        assert_eq!(stats.object_refs.len(), 2);

        let tracked_entry = stats
            .object_refs
            .iter()
            .find(|e| e.object_id == tracked.binary())
            .unwrap();
        assert!(tracked_entry.pinned_in_memory);
        // The record's own size is unknown; the pinned size fills in.
        assert_eq!(tracked_entry.object_size, 2048);
        assert_eq!(tracked_entry.call_site, "lib.py:10");
        assert_eq!(tracked_entry.local_ref_count, 1);
        assert_eq!(tracked_entry.task_status, TaskStatus::Finished as i32);

        let pinned_entry = stats
            .object_refs
            .iter()
            .find(|e| e.object_id == pinned_only.binary())
            .unwrap();
        assert!(pinned_entry.pinned_in_memory);
        assert_eq!(pinned_entry.object_size, 512);

        let mut capped = CoreWorkerStats::default();
        h.rc.add_object_ref_stats(&pinned, &mut capped, 1);
        assert_eq!(capped.object_refs.len(), 1);
    }

    #[test]
    fn test_get_all_reference_counts() {
        let h = harness(false);
        let id = object_id();
        h.rc.add_local_reference(&id, "");
        h.rc.add_local_reference(&id, "");
        let mut deleted = Vec::new();
        h.rc.update_submitted_task_references(&[], &[id], &[], &mut deleted);

        let counts = h.rc.get_all_reference_counts();
        assert_eq!(counts.get(&id), Some(&(2, 1)));
        assert_eq!(h.rc.get_all_in_scope_object_ids().len(), 1);
    }

    #[test]
    fn test_debug_string() {
        let h = harness(false);
        assert_eq!(h.rc.debug_string(), "ReferenceTable{size: 0}");
        let id = object_id();
        h.rc.add_local_reference(&id, "");
        let s = h.rc.debug_string();
        assert!(s.contains("size: 1"));
        assert!(s.contains("local_ref_count: 1"));
    }
}
