// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pub/sub messaging for Orbit workers.
//!
//! Defines the publisher/subscriber interfaces consumed by the worker
//! runtime, plus an in-process broker for same-process wiring and tests.
//! Both `publish` and `subscribe` are non-blocking enqueues; callers may
//! hold locks across them, and delivery happens later on the draining
//! thread.

pub mod broker;

pub use broker::{InProcessBroker, InProcessPublisher, InProcessSubscriber};

use std::sync::Arc;

use orbit_common::status::Error;
use orbit_proto::rpc::{Address, ChannelType, PubMessage, SubMessage};

/// Invoked when a message the subscriber asked for is published.
pub type MessagePublishedCallback = Arc<dyn Fn(PubMessage) + Send + Sync>;

/// Invoked with the subscription key when the publisher fails (e.g. the
/// publishing worker died before ever publishing).
pub type PublisherFailedCallback = Arc<dyn Fn(&[u8], &Error) + Send + Sync>;

/// Publishing side of worker pub/sub.
pub trait Publisher: Send + Sync {
    /// Publish a message on the channel/key carried inside `msg`.
    /// Returns false if the message could not be enqueued.
    fn publish(&self, msg: PubMessage) -> bool;

    /// Notify subscribers of `key_id` on `channel` that no publication
    /// will ever arrive (the entity behind the key is gone).
    fn publish_failure(&self, channel: ChannelType, key_id: &[u8]);
}

/// Subscribing side of worker pub/sub.
pub trait Subscriber: Send + Sync {
    /// Subscribe to `key_id` on `channel` at the worker behind
    /// `publisher_address`, delivering `sub_message` to that worker so it
    /// can react to the subscription. Returns false if the subscription
    /// could not be registered.
    fn subscribe(
        &self,
        sub_message: SubMessage,
        channel: ChannelType,
        publisher_address: &Address,
        key_id: &[u8],
        on_message: MessagePublishedCallback,
        on_failure: PublisherFailedCallback,
    ) -> bool;

    /// Drop a subscription. Returns whether it existed.
    fn unsubscribe(&self, channel: ChannelType, publisher_address: &Address, key_id: &[u8])
        -> bool;
}

/// Publisher-side hook: lets a worker react when somebody subscribes to
/// one of its keys (e.g. an owner asking to be told when a borrowed ref
/// is removed).
pub trait SubscriptionHandler: Send + Sync {
    fn on_subscribed(&self, channel: ChannelType, key_id: &[u8], sub_message: &SubMessage);
}
