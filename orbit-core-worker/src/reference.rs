// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-object reference record.
//!
//! Pure data; every field is mutated only while the owning
//! [`ReferenceCounter`](crate::ReferenceCounter) holds its mutex.

use std::collections::{HashMap, HashSet};

use orbit_common::id::{NodeID, ObjectID, WorkerID};
use orbit_proto::rpc::{Address, ObjectReference, ObjectReferenceCount, TensorTransport};

/// Fires exactly once, when the record is finally erased from the table.
pub type ObjectRefDeleteCallback = Box<dyn FnOnce(&ObjectID) + Send>;

/// Fires each time the record transitions to out-of-scope or is explicitly
/// freed. Invoked with the counter's mutex held; must not call back into
/// the counter.
pub type OutOfScopeCallback = Box<dyn Fn(&ObjectID) + Send + Sync>;

/// Borrow state, allocated lazily on first use.
///
/// Only owners accumulate `borrowers`; borrowers accumulate
/// `stored_in_objects` until the state is handed back toward the owner.
#[derive(Default)]
pub(crate) struct BorrowInfo {
    /// Workers currently borrowing this id, keyed by worker id.
    pub borrowers: HashMap<WorkerID, Address>,
    /// Outer ids owned by other workers that this id was serialized into.
    pub stored_in_objects: HashMap<ObjectID, Address>,
}

/// Containment edges, allocated lazily on first use.
#[derive(Default)]
pub(crate) struct NestedInfo {
    /// Inner ids nested inside this one.
    pub contains: HashSet<ObjectID>,
    /// Outer ids we own that contain this one.
    pub contained_in_owned: HashSet<ObjectID>,
    /// Outer ids we do not own that contain this one.
    pub contained_in_borrowed_ids: HashSet<ObjectID>,
}

/// Ownership and reference state for a single object id.
pub(crate) struct Reference {
    /// Set once ownership is known. Absent means the id was seen but the
    /// owner has not been learned yet.
    pub owner_address: Option<Address>,
    pub owned_by_us: bool,

    /// Handles the application currently holds.
    pub local_ref_count: usize,
    /// Outstanding tasks that took this id as an argument.
    pub submitted_task_ref_count: usize,
    /// Downstream tasks whose reconstruction may need this id. Only
    /// meaningful while lineage pinning is enabled.
    pub lineage_ref_count: usize,

    pub call_site: String,
    /// -1 while unknown.
    pub object_size: i64,

    pub borrow_info: Option<Box<BorrowInfo>>,
    pub nested_info: Option<Box<NestedInfo>>,

    /// Dirty bit: an in-use inner ref still has to be flushed back to its
    /// owner at the next report-up.
    pub has_nested_refs_to_report: bool,
    /// An upstream worker is already tracking this borrow on our behalf, so
    /// we must not report it a second time.
    pub foreign_owner_already_monitoring: bool,

    pub pinned_at_node_id: Option<NodeID>,
    pub locations: HashSet<NodeID>,
    pub spilled: bool,
    pub did_spill: bool,
    pub spilled_url: String,
    pub spilled_node_id: NodeID,
    pub pending_creation: bool,

    pub is_reconstructable: bool,
    pub lineage_evicted: bool,

    pub tensor_transport: TensorTransport,

    /// The owner subscribed to this borrow; a ref-removed reply is owed
    /// when the ref count next drains to zero. Set only on borrowed
    /// records.
    pub on_ref_removed: bool,
    pub on_object_ref_delete: Option<ObjectRefDeleteCallback>,
    pub on_object_out_of_scope_or_freed_callbacks: Vec<OutOfScopeCallback>,
}

impl Reference {
    /// A record for an id whose owner is not known yet.
    pub fn new() -> Self {
        Self {
            owner_address: None,
            owned_by_us: false,
            local_ref_count: 0,
            submitted_task_ref_count: 0,
            lineage_ref_count: 0,
            call_site: String::new(),
            object_size: -1,
            borrow_info: None,
            nested_info: None,
            has_nested_refs_to_report: false,
            foreign_owner_already_monitoring: false,
            pinned_at_node_id: None,
            locations: HashSet::new(),
            spilled: false,
            did_spill: false,
            spilled_url: String::new(),
            spilled_node_id: NodeID::nil(),
            pending_creation: false,
            is_reconstructable: false,
            lineage_evicted: false,
            tensor_transport: TensorTransport::ObjectStore,
            on_ref_removed: false,
            on_object_ref_delete: None,
            on_object_out_of_scope_or_freed_callbacks: Vec::new(),
        }
    }

    /// A record created by a local reference to an unknown id.
    pub fn with_call_site(call_site: &str, object_size: i64) -> Self {
        Self {
            call_site: call_site.to_string(),
            object_size,
            ..Self::new()
        }
    }

    /// A record for an object owned by this worker.
    pub fn owned(
        owner_address: Address,
        call_site: &str,
        object_size: i64,
        is_reconstructable: bool,
        pinned_at_node_id: Option<NodeID>,
        tensor_transport: TensorTransport,
    ) -> Self {
        Self {
            owner_address: Some(owner_address),
            owned_by_us: true,
            call_site: call_site.to_string(),
            object_size,
            is_reconstructable,
            pinned_at_node_id,
            tensor_transport,
            ..Self::new()
        }
    }

    pub fn borrow(&self) -> Option<&BorrowInfo> {
        self.borrow_info.as_deref()
    }

    pub fn borrow_mut(&mut self) -> &mut BorrowInfo {
        self.borrow_info.get_or_insert_with(Box::default)
    }

    pub fn nested(&self) -> Option<&NestedInfo> {
        self.nested_info.as_deref()
    }

    pub fn nested_mut(&mut self) -> &mut NestedInfo {
        self.nested_info.get_or_insert_with(Box::default)
    }

    pub fn contains_ids(&self) -> Vec<ObjectID> {
        self.nested()
            .map(|n| n.contains.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contained_in_borrowed_cloned(&self) -> Vec<ObjectID> {
        self.nested()
            .map(|n| n.contained_in_borrowed_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The total number of reasons this id is still in scope.
    pub fn ref_count(&self) -> usize {
        let borrow = self
            .borrow()
            .map_or(0, |b| b.borrowers.len() + b.stored_in_objects.len());
        let nested = self.nested().map_or(0, |n| n.contained_in_owned.len());
        self.local_ref_count
            + self.submitted_task_ref_count
            + borrow
            + nested
            + usize::from(self.has_nested_refs_to_report)
    }

    /// Whether it is safe to release the underlying value.
    pub fn out_of_scope(&self, _lineage_pinning_enabled: bool) -> bool {
        self.ref_count() == 0
    }

    /// Whether the record itself can be erased from the table.
    pub fn should_delete(&self, lineage_pinning_enabled: bool) -> bool {
        if lineage_pinning_enabled {
            self.out_of_scope(lineage_pinning_enabled) && self.lineage_ref_count == 0
        } else {
            self.out_of_scope(lineage_pinning_enabled)
        }
    }

    /// Build a borrowed-refs report entry from this record.
    ///
    /// `deduct_local_ref` masks the artificial reference the runtime pinned
    /// during task execution so the caller's accounting is not inflated.
    /// The entry's `reference.object_id` is filled in by the table-to-proto
    /// conversion.
    pub fn to_proto(&self, deduct_local_ref: bool) -> ObjectReferenceCount {
        let mut entry = ObjectReferenceCount {
            reference: Some(ObjectReference {
                object_id: Vec::new(),
                owner_address: self.owner_address.clone(),
            }),
            has_local_ref: self.ref_count() > usize::from(deduct_local_ref),
            ..Default::default()
        };
        if let Some(borrow) = self.borrow() {
            entry.borrowers = borrow.borrowers.values().cloned().collect();
            entry.stored_in_objects = borrow
                .stored_in_objects
                .iter()
                .map(|(object_id, owner)| ObjectReference {
                    object_id: object_id.binary(),
                    owner_address: Some(owner.clone()),
                })
                .collect();
        }
        if let Some(nested) = self.nested() {
            entry.contained_in_borrowed_ids = nested
                .contained_in_borrowed_ids
                .iter()
                .map(|id| id.binary())
                .collect();
            entry.contains = nested.contains.iter().map(|id| id.binary()).collect();
        }
        entry
    }

    /// Rebuild the borrower's view of a record from a report entry.
    pub fn from_proto(entry: &ObjectReferenceCount) -> Self {
        let mut reference = Reference::new();
        reference.owner_address = entry
            .reference
            .as_ref()
            .and_then(|r| r.owner_address.clone());
        reference.local_ref_count = usize::from(entry.has_local_ref);
        for borrower in &entry.borrowers {
            reference
                .borrow_mut()
                .borrowers
                .insert(WorkerID::from_binary(&borrower.worker_id), borrower.clone());
        }
        for stored in &entry.stored_in_objects {
            let object_id = ObjectID::from_binary(&stored.object_id);
            let owner = stored
                .owner_address
                .clone()
                .expect("stored_in_objects entry missing owner address");
            reference
                .borrow_mut()
                .stored_in_objects
                .insert(object_id, owner);
        }
        for id in &entry.contains {
            reference.nested_mut().contains.insert(ObjectID::from_binary(id));
        }
        for id in &entry.contained_in_borrowed_ids {
            reference
                .nested_mut()
                .contained_in_borrowed_ids
                .insert(ObjectID::from_binary(id));
        }
        reference
    }

    pub fn debug_string(&self) -> String {
        format!(
            "Reference{{borrowers: {} local_ref_count: {} submitted_count: {} \
             contained_in_owned: {} contained_in_borrowed: {} contains: {} stored_in: {} \
             lineage_ref_count: {}}}",
            self.borrow().map_or(0, |b| b.borrowers.len()),
            self.local_ref_count,
            self.submitted_task_ref_count,
            self.nested().map_or(0, |n| n.contained_in_owned.len()),
            self.nested().map_or(0, |n| n.contained_in_borrowed_ids.len()),
            self.nested().map_or(0, |n| n.contains.len()),
            self.borrow().map_or(0, |b| b.stored_in_objects.len()),
            self.lineage_ref_count,
        )
    }
}
