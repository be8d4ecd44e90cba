// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize logging for an Orbit component.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (`ORBIT_LOG_LEVEL` or `RUST_LOG`)
/// - Optional file output
/// - Component name in log lines
pub fn init_logging(component: &str, log_dir: Option<&Path>, verbosity: i32) {
    let filter = EnvFilter::try_from_env("ORBIT_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| {
            let level = match verbosity {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            EnvFilter::new(level)
        });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(dir) = log_dir {
        let log_file = dir.join(format!("{component}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .expect("Failed to open log file");
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    tracing::info!(component, "Orbit logging initialized");
}

/// Emit a `tracing::warn!` at most once per `interval_ms` per call site.
///
/// Used on hot paths where a misbehaving caller would otherwise flood the
/// log, e.g. repeated ref-count decrements on an unknown object id.
#[macro_export]
macro_rules! warn_every_ms {
    ($interval_ms:expr, $($arg:tt)*) => {{
        static LAST_LOG_MS: ::std::sync::atomic::AtomicU64 =
            ::std::sync::atomic::AtomicU64::new(0);
        let now = $crate::time::current_time_ms();
        let last = LAST_LOG_MS.load(::std::sync::atomic::Ordering::Relaxed);
        if now.saturating_sub(last) >= $interval_ms
            && LAST_LOG_MS
                .compare_exchange(
                    last,
                    now,
                    ::std::sync::atomic::Ordering::Relaxed,
                    ::std::sync::atomic::Ordering::Relaxed,
                )
                .is_ok()
        {
            ::tracing::warn!($($arg)*);
        }
    }};
}
