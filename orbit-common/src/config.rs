// Copyright 2024 The Orbit Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Orbit worker configuration.
//!
//! A plain struct with defaults. Overrides come from a JSON config string
//! (as sent by the process launcher) and from `ORBIT_*` environment
//! variables, applied in that order.

use std::sync::OnceLock;

/// Global configuration singleton, initialized lazily with defaults if
/// `initialize_config` was never called.
static ORBIT_CONFIG: OnceLock<OrbitConfig> = OnceLock::new();

/// Get the global OrbitConfig.
pub fn orbit_config() -> &'static OrbitConfig {
    ORBIT_CONFIG.get_or_init(OrbitConfig::from_env)
}

/// Initialize the global OrbitConfig from a JSON string.
/// Returns an error if already initialized.
pub fn initialize_config(config_str: Option<&str>) -> Result<(), String> {
    let config = match config_str {
        Some(s) if !s.is_empty() => OrbitConfig::from_json(s)?,
        _ => OrbitConfig::from_env(),
    };
    ORBIT_CONFIG
        .set(config)
        .map_err(|_| "OrbitConfig already initialized".to_string())
}

/// Worker configuration parameters.
#[derive(Debug, Clone)]
pub struct OrbitConfig {
    /// Whether owned objects pin the lineage needed to reconstruct them.
    /// When disabled, objects are deleted as soon as they go out of scope.
    pub lineage_pinning_enabled: bool,

    /// Soft cap on bytes of lineage retained per worker; the task layer
    /// evicts oldest-first once the cap is exceeded.
    pub max_lineage_bytes: i64,

    /// Cap on entries emitted by object-ref stats reporting. -1 = no cap.
    pub object_ref_stats_limit: i64,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            lineage_pinning_enabled: true,
            max_lineage_bytes: 1024 * 1024 * 1024,
            object_ref_stats_limit: -1,
        }
    }
}

impl OrbitConfig {
    /// Parse from a JSON string, starting from defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

        let mut config = Self::default();
        if let Some(v) = map.get("lineage_pinning_enabled").and_then(|v| v.as_bool()) {
            config.lineage_pinning_enabled = v;
        }
        if let Some(v) = map.get("max_lineage_bytes").and_then(|v| v.as_i64()) {
            config.max_lineage_bytes = v;
        }
        if let Some(v) = map.get("object_ref_stats_limit").and_then(|v| v.as_i64()) {
            config.object_ref_stats_limit = v;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus `ORBIT_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORBIT_LINEAGE_PINNING_ENABLED") {
            if let Ok(parsed) = v.parse::<bool>() {
                self.lineage_pinning_enabled = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORBIT_MAX_LINEAGE_BYTES") {
            if let Ok(parsed) = v.parse::<i64>() {
                self.max_lineage_bytes = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORBIT_OBJECT_REF_STATS_LIMIT") {
            if let Ok(parsed) = v.parse::<i64>() {
                self.object_ref_stats_limit = parsed;
            }
        }
    }
}
