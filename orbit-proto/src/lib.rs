// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Protobuf types for the Orbit worker wire surface.
//!
//! Message structs carry `prost::Message` derives directly so the crate
//! builds without protoc. Field tags are part of the wire contract; do not
//! renumber them.

/// All Orbit protobuf types organized by package.
pub mod orbit {
    /// Worker RPC types (package `orbit.rpc`).
    pub mod rpc {
        /// The address of a worker process.
        ///
        /// Two addresses refer to the same worker iff their `worker_id`
        /// bytes match; the endpoint fields are routing hints.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Address {
            #[prost(bytes = "vec", tag = "1")]
            pub node_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(string, tag = "2")]
            pub ip_address: ::prost::alloc::string::String,
            #[prost(int32, tag = "3")]
            pub port: i32,
            #[prost(bytes = "vec", tag = "4")]
            pub worker_id: ::prost::alloc::vec::Vec<u8>,
        }

        /// An object id together with what we know about its owner.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ObjectReference {
            #[prost(bytes = "vec", tag = "1")]
            pub object_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(message, optional, tag = "2")]
            pub owner_address: ::core::option::Option<Address>,
        }

        /// One entry of a borrowed-refs report: everything a borrower knows
        /// about a single object id at the moment it hands its borrow state
        /// back toward the owner.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ObjectReferenceCount {
            #[prost(message, optional, tag = "1")]
            pub reference: ::core::option::Option<ObjectReference>,
            /// Whether the borrower still holds a local reference, after
            /// masking the artificial ref pinned during task execution.
            #[prost(bool, tag = "2")]
            pub has_local_ref: bool,
            /// Workers that the borrower passed the id on to.
            #[prost(message, repeated, tag = "3")]
            pub borrowers: ::prost::alloc::vec::Vec<Address>,
            /// Outer ids (and their owners) that the borrower serialized
            /// this id into.
            #[prost(message, repeated, tag = "4")]
            pub stored_in_objects: ::prost::alloc::vec::Vec<ObjectReference>,
            /// Outer ids not owned by the borrower that contain this id.
            #[prost(bytes = "vec", repeated, tag = "5")]
            pub contained_in_borrowed_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
            /// Ids nested inside this one.
            #[prost(bytes = "vec", repeated, tag = "6")]
            pub contains: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
        }

        /// Location snapshot published on the object-locations channel.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WorkerObjectLocationsPubMessage {
            #[prost(bytes = "vec", repeated, tag = "1")]
            pub node_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
            #[prost(int64, tag = "2")]
            pub object_size: i64,
            #[prost(string, tag = "3")]
            pub spilled_url: ::prost::alloc::string::String,
            #[prost(bytes = "vec", tag = "4")]
            pub spilled_node_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "5")]
            pub primary_node_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bool, tag = "6")]
            pub pending_creation: bool,
            #[prost(bool, tag = "7")]
            pub did_spill: bool,
            /// Set when the record was already erased by the time the
            /// snapshot was requested.
            #[prost(bool, tag = "8")]
            pub ref_removed: bool,
        }

        /// Subscription request: the owner asks a borrower to report when
        /// its reference to the object is removed.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WorkerRefRemovedSubMessage {
            #[prost(message, optional, tag = "1")]
            pub reference: ::core::option::Option<ObjectReference>,
            #[prost(bytes = "vec", tag = "2")]
            pub contained_in_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "3")]
            pub intended_worker_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(bytes = "vec", tag = "4")]
            pub subscriber_worker_id: ::prost::alloc::vec::Vec<u8>,
        }

        /// Reply published by a borrower whose reference was removed,
        /// carrying any accumulated sub-borrow state.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WorkerRefRemovedPubMessage {
            #[prost(message, repeated, tag = "1")]
            pub borrowed_refs: ::prost::alloc::vec::Vec<ObjectReferenceCount>,
        }

        /// Pub/sub channels used by the worker.
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum ChannelType {
            WorkerObjectLocationsChannel = 0,
            WorkerRefRemovedChannel = 1,
        }

        /// How an object's payload travels between workers.
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum TensorTransport {
            ObjectStore = 0,
            Nccl = 1,
            Gloo = 2,
        }

        /// A message published on a pub/sub channel, keyed by object id.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct PubMessage {
            #[prost(enumeration = "ChannelType", tag = "1")]
            pub channel_type: i32,
            #[prost(bytes = "vec", tag = "2")]
            pub key_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(oneof = "pub_message::Inner", tags = "3, 4")]
            pub inner: ::core::option::Option<pub_message::Inner>,
        }

        /// Nested message types for [`PubMessage`].
        pub mod pub_message {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Inner {
                #[prost(message, tag = "3")]
                WorkerObjectLocationsMessage(super::WorkerObjectLocationsPubMessage),
                #[prost(message, tag = "4")]
                WorkerRefRemovedMessage(super::WorkerRefRemovedPubMessage),
            }
        }

        /// A subscription request sent to a publishing worker.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct SubMessage {
            #[prost(oneof = "sub_message::Inner", tags = "1")]
            pub inner: ::core::option::Option<sub_message::Inner>,
        }

        /// Nested message types for [`SubMessage`].
        pub mod sub_message {
            #[derive(Clone, PartialEq, ::prost::Oneof)]
            pub enum Inner {
                #[prost(message, tag = "1")]
                WorkerRefRemovedMessage(super::WorkerRefRemovedSubMessage),
            }
        }

        /// Task status values surfaced through object-ref stats.
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum TaskStatus {
            Unspecified = 0,
            Finished = 1,
        }

        /// One entry of the worker's object-ref stats dump.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct ObjectRefInfo {
            #[prost(bytes = "vec", tag = "1")]
            pub object_id: ::prost::alloc::vec::Vec<u8>,
            #[prost(string, tag = "2")]
            pub call_site: ::prost::alloc::string::String,
            #[prost(int64, tag = "3")]
            pub object_size: i64,
            #[prost(uint64, tag = "4")]
            pub local_ref_count: u64,
            #[prost(uint64, tag = "5")]
            pub submitted_task_ref_count: u64,
            #[prost(bool, tag = "6")]
            pub pinned_in_memory: bool,
            #[prost(bytes = "vec", repeated, tag = "7")]
            pub contained_in_owned: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
            #[prost(enumeration = "TaskStatus", tag = "8")]
            pub task_status: i32,
        }

        /// Aggregate worker stats (object-ref section).
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct CoreWorkerStats {
            #[prost(message, repeated, tag = "1")]
            pub object_refs: ::prost::alloc::vec::Vec<ObjectRefInfo>,
            #[prost(int64, tag = "2")]
            pub objects_total: i64,
        }
    }
}

// Re-export the main namespace for convenience
pub use orbit::rpc;

#[cfg(test)]
mod tests {
    use super::rpc;
    use prost::Message;

    #[test]
    fn test_address_encode_roundtrip() {
        let addr = rpc::Address {
            node_id: vec![1u8; 28],
            ip_address: "10.0.0.1".to_string(),
            port: 4801,
            worker_id: vec![2u8; 28],
        };
        let bytes = addr.encode_to_vec();
        let decoded = rpc::Address::decode(bytes.as_slice()).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn test_pub_message_oneof_roundtrip() {
        let msg = rpc::PubMessage {
            channel_type: rpc::ChannelType::WorkerRefRemovedChannel as i32,
            key_id: vec![7u8; 28],
            inner: Some(rpc::pub_message::Inner::WorkerRefRemovedMessage(
                rpc::WorkerRefRemovedPubMessage {
                    borrowed_refs: vec![rpc::ObjectReferenceCount {
                        reference: Some(rpc::ObjectReference {
                            object_id: vec![9u8; 28],
                            owner_address: None,
                        }),
                        has_local_ref: true,
                        ..Default::default()
                    }],
                },
            )),
        };
        let bytes = msg.encode_to_vec();
        let decoded = rpc::PubMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(
            rpc::ChannelType::try_from(decoded.channel_type),
            Ok(rpc::ChannelType::WorkerRefRemovedChannel)
        );
    }

    #[test]
    fn test_object_reference_count_defaults() {
        let entry = rpc::ObjectReferenceCount::default();
        assert!(!entry.has_local_ref);
        assert!(entry.borrowers.is_empty());
        assert!(entry.stored_in_objects.is_empty());
        assert!(entry.contains.is_empty());
        assert!(entry.contained_in_borrowed_ids.is_empty());
    }

    #[test]
    fn test_locations_message_roundtrip() {
        let msg = rpc::WorkerObjectLocationsPubMessage {
            node_ids: vec![vec![3u8; 28], vec![4u8; 28]],
            object_size: 1024,
            spilled_url: "s3://bucket/key".to_string(),
            spilled_node_id: vec![3u8; 28],
            primary_node_id: vec![4u8; 28],
            pending_creation: false,
            did_spill: true,
            ref_removed: false,
        };
        let bytes = msg.encode_to_vec();
        let decoded = rpc::WorkerObjectLocationsPubMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }
}
