// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-process pub/sub broker.
//!
//! Routes messages between workers living in the same process. Every
//! operation enqueues; nothing is delivered until [`InProcessBroker::drain`]
//! runs, so callers may invoke publish/subscribe while holding their own
//! locks. Payloads cross the broker encoded, exactly as they would cross
//! the network.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use prost::Message;

use orbit_common::status::Error;
use orbit_proto::rpc::{Address, ChannelType, PubMessage, SubMessage};

use crate::{
    MessagePublishedCallback, Publisher, PublisherFailedCallback, SubscriptionHandler,
    Subscriber,
};

/// (channel, publisher worker id, key id)
type SubKey = (i32, Vec<u8>, Vec<u8>);

struct Subscription {
    on_message: MessagePublishedCallback,
    on_failure: PublisherFailedCallback,
}

enum Event {
    Publish {
        publisher_worker_id: Vec<u8>,
        payload: Vec<u8>,
    },
    PublishFailure {
        publisher_worker_id: Vec<u8>,
        channel: i32,
        key_id: Vec<u8>,
    },
    SubscribeNotify {
        publisher_worker_id: Vec<u8>,
        channel: i32,
        key_id: Vec<u8>,
        payload: Vec<u8>,
    },
    WorkerFailure {
        publisher_worker_id: Vec<u8>,
    },
}

/// Broker shared by every in-process worker.
#[derive(Default)]
pub struct InProcessBroker {
    subscriptions: DashMap<SubKey, Subscription>,
    handlers: DashMap<Vec<u8>, Arc<dyn SubscriptionHandler>>,
    queue: Mutex<VecDeque<Event>>,
}

impl InProcessBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the handler invoked when somebody subscribes to a key
    /// published by `worker_id`.
    pub fn register_handler(&self, worker_id: &[u8], handler: Arc<dyn SubscriptionHandler>) {
        self.handlers.insert(worker_id.to_vec(), handler);
    }

    /// A publisher handle bound to `worker_id`.
    pub fn publisher_for(self: &Arc<Self>, worker_id: &[u8]) -> Arc<InProcessPublisher> {
        Arc::new(InProcessPublisher {
            broker: Arc::clone(self),
            worker_id: worker_id.to_vec(),
        })
    }

    /// The shared subscriber handle.
    pub fn subscriber(self: &Arc<Self>) -> Arc<InProcessSubscriber> {
        Arc::new(InProcessSubscriber {
            broker: Arc::clone(self),
        })
    }

    /// Simulate the death of a publishing worker: every subscription
    /// against it fails.
    pub fn fail_worker(&self, worker_id: &[u8]) {
        self.queue.lock().push_back(Event::WorkerFailure {
            publisher_worker_id: worker_id.to_vec(),
        });
    }

    fn enqueue(&self, event: Event) {
        self.queue.lock().push_back(event);
    }

    /// Deliver queued events until the queue is quiescent. Deliveries may
    /// enqueue further events (e.g. a subscription handler publishing a
    /// reply); those are drained too.
    pub fn drain(&self) {
        loop {
            let event = self.queue.lock().pop_front();
            let Some(event) = event else {
                return;
            };
            match event {
                Event::Publish {
                    publisher_worker_id,
                    payload,
                } => self.deliver_publish(publisher_worker_id, &payload),
                Event::PublishFailure {
                    publisher_worker_id,
                    channel,
                    key_id,
                } => self.deliver_failure((channel, publisher_worker_id, key_id)),
                Event::SubscribeNotify {
                    publisher_worker_id,
                    channel,
                    key_id,
                    payload,
                } => self.deliver_subscribe_notify(publisher_worker_id, channel, key_id, &payload),
                Event::WorkerFailure {
                    publisher_worker_id,
                } => {
                    let keys: Vec<SubKey> = self
                        .subscriptions
                        .iter()
                        .filter(|e| e.key().1 == publisher_worker_id)
                        .map(|e| e.key().clone())
                        .collect();
                    for key in keys {
                        self.deliver_failure(key);
                    }
                }
            }
        }
    }

    fn deliver_publish(&self, publisher_worker_id: Vec<u8>, payload: &[u8]) {
        let msg = match PubMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("dropping undecodable pub message: {e}");
                return;
            }
        };
        let key = (msg.channel_type, publisher_worker_id, msg.key_id.clone());
        let on_message = self.subscriptions.get(&key).map(|s| s.on_message.clone());
        match on_message {
            Some(cb) => cb(msg),
            None => {
                tracing::debug!(channel = msg.channel_type, "no subscriber for published key");
            }
        }
    }

    fn deliver_failure(&self, key: SubKey) {
        if let Some((_, sub)) = self.subscriptions.remove(&key) {
            let err = Error::disconnected("publisher failed before publishing");
            (sub.on_failure)(&key.2, &err);
        }
    }

    fn deliver_subscribe_notify(
        &self,
        publisher_worker_id: Vec<u8>,
        channel: i32,
        key_id: Vec<u8>,
        payload: &[u8],
    ) {
        let sub_message = match SubMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("dropping undecodable sub message: {e}");
                return;
            }
        };
        let Ok(channel) = ChannelType::try_from(channel) else {
            tracing::warn!(channel, "subscription for unknown channel");
            return;
        };
        let handler = self
            .handlers
            .get(&publisher_worker_id)
            .map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            handler.on_subscribed(channel, &key_id, &sub_message);
        }
    }
}

/// [`Publisher`] implementation bound to one in-process worker.
pub struct InProcessPublisher {
    broker: Arc<InProcessBroker>,
    worker_id: Vec<u8>,
}

impl Publisher for InProcessPublisher {
    fn publish(&self, msg: PubMessage) -> bool {
        self.broker.enqueue(Event::Publish {
            publisher_worker_id: self.worker_id.clone(),
            payload: msg.encode_to_vec(),
        });
        true
    }

    fn publish_failure(&self, channel: ChannelType, key_id: &[u8]) {
        self.broker.enqueue(Event::PublishFailure {
            publisher_worker_id: self.worker_id.clone(),
            channel: channel as i32,
            key_id: key_id.to_vec(),
        });
    }
}

/// [`Subscriber`] implementation over the shared broker.
pub struct InProcessSubscriber {
    broker: Arc<InProcessBroker>,
}

impl Subscriber for InProcessSubscriber {
    fn subscribe(
        &self,
        sub_message: SubMessage,
        channel: ChannelType,
        publisher_address: &Address,
        key_id: &[u8],
        on_message: MessagePublishedCallback,
        on_failure: PublisherFailedCallback,
    ) -> bool {
        let key = (
            channel as i32,
            publisher_address.worker_id.clone(),
            key_id.to_vec(),
        );
        if self
            .broker
            .subscriptions
            .insert(
                key,
                Subscription {
                    on_message,
                    on_failure,
                },
            )
            .is_some()
        {
            tracing::warn!("replacing existing subscription for key");
        }
        self.broker.enqueue(Event::SubscribeNotify {
            publisher_worker_id: publisher_address.worker_id.clone(),
            channel: channel as i32,
            key_id: key_id.to_vec(),
            payload: sub_message.encode_to_vec(),
        });
        true
    }

    fn unsubscribe(
        &self,
        channel: ChannelType,
        publisher_address: &Address,
        key_id: &[u8],
    ) -> bool {
        let key = (
            channel as i32,
            publisher_address.worker_id.clone(),
            key_id.to_vec(),
        );
        self.broker.subscriptions.remove(&key).is_some()
    }
}
