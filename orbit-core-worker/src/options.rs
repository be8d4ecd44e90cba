// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Core worker configuration options.

use orbit_common::config::orbit_config;
use orbit_common::id::{NodeID, WorkerID};
use orbit_proto::rpc::Address;

/// Options for initializing a core worker.
#[derive(Debug, Clone)]
pub struct CoreWorkerOptions {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub node_ip_address: String,
    pub port: i32,
    pub lineage_pinning_enabled: bool,
    pub max_lineage_bytes: i64,
}

impl Default for CoreWorkerOptions {
    fn default() -> Self {
        let config = orbit_config();
        Self {
            worker_id: WorkerID::from_random(),
            node_id: NodeID::nil(),
            node_ip_address: "127.0.0.1".to_string(),
            port: 0,
            lineage_pinning_enabled: config.lineage_pinning_enabled,
            max_lineage_bytes: config.max_lineage_bytes,
        }
    }
}

impl CoreWorkerOptions {
    /// The address other workers use to reach this one.
    pub fn rpc_address(&self) -> Address {
        Address {
            node_id: self.node_id.binary(),
            ip_address: self.node_ip_address.clone(),
            port: self.port,
            worker_id: self.worker_id.binary(),
        }
    }
}
