// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Utility library for Orbit workers.
//!
//! Provides logging setup, randomness, and time helpers shared by the
//! other workspace crates.

pub mod logging;
pub mod random;
pub mod time;
