// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Process-wide constants.

/// Length of Orbit full-length unique IDs in bytes.
pub const UNIQUE_ID_SIZE: usize = 28;

/// Object index bit width.
pub const OBJECT_ID_INDEX_SIZE: usize = 32;

/// Orbit version string.
pub const ORBIT_VERSION: &str = "0.4.0-dev";

/// Interval for throttled warnings on misuse of the reference counter.
pub const REF_COUNT_WARN_INTERVAL_MS: u64 = 5_000;
