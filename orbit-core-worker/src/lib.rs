// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Core worker runtime for Orbit.
//!
//! Hosts the distributed object reference counter: the component that
//! decides, for every object handle this worker knows about, when the
//! underlying value may be released, when the worker can stop tracking the
//! id entirely, and when lineage retained for reconstruction may be
//! dropped.

pub mod options;
mod reference;
pub mod reference_counter;

pub use reference::{ObjectRefDeleteCallback, OutOfScopeCallback};
pub use reference_counter::{
    LineageReleasedCallback, LocalityData, NodeAliveChecker, ObjectPinInfo, ReferenceCounter,
};
