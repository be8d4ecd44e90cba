// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Orbit status/error types.
//!
//! Fallible operations across crate seams return `Result<T, Error>`.

use std::fmt;

/// Status codes for cross-component failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCode {
    Invalid = 1,
    IoError = 2,
    TimedOut = 3,
    NotFound = 4,
    Disconnected = 5,
    ChannelError = 6,
    ObjectNotFound = 7,
    ObjectUnknownOwner = 8,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::IoError => "IOError",
            Self::TimedOut => "TimedOut",
            Self::NotFound => "NotFound",
            Self::Disconnected => "Disconnected",
            Self::ChannelError => "ChannelError",
            Self::ObjectNotFound => "ObjectNotFound",
            Self::ObjectUnknownOwner => "ObjectUnknownOwner",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for Orbit operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: StatusCode,
    pub message: String,
}

impl Error {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, message)
    }

    pub fn channel_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ChannelError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn is(&self, code: StatusCode) -> bool {
        self.code == code
    }
}
