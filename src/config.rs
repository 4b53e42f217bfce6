//! JIT options governing speculation
//!
//! Every knob has a default that matches a production-sized VM; options files
//! are JSON and may name any subset of the fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on concurrent compilations (width of the per-node slot bit vector)
pub const MAX_COMPILE_THREADS: usize = 32;

/// Options consulted by the selector, cast planner, registry and commit pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitOptions {
    /// Node budget of a capped subclass walk
    pub max_num_visited_subclasses: usize,
    /// Minimum receiver frequency for a profiled guard
    pub min_profiled_call_frequency: f64,
    /// Minimum class frequency for a profiled cast test
    pub min_profiled_checkcast_frequency: f64,
    /// Maximum profiled classes tested inline by a cast
    pub max_profiled_classes: usize,
    /// Sample floor for treating one profiled class as certain
    pub high_probability_min_samples: u64,
    /// Slots of the on-site instanceof cache (0 disables dynamic cache tests)
    pub max_onsite_cache_slots_for_instanceof: usize,
    /// Whether runtime-variable casts may get an inline superclass test
    pub supports_inlining_of_is_instance: bool,
    /// Disable every class-hierarchy optimization
    pub disable_ch_opts: bool,
    /// Coalesce OSR / static-final sites into one shared multi-site record
    pub group_osr_assumptions: bool,
    /// Whether mutable-call-site guards are registered for patching
    pub invalidate_mutable_call_site_guards: bool,
    /// Whether breakpoint guards are NOP-patched (and thus need assumptions)
    pub nop_breakpoint_guards: bool,
    /// Favor method tests while the VM is still starting up
    pub prefer_method_test_at_startup: bool,
    /// Number of compile-thread slots
    pub max_compile_threads: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            max_num_visited_subclasses: 500,
            min_profiled_call_frequency: 0.10,
            min_profiled_checkcast_frequency: 0.20,
            max_profiled_classes: 4,
            high_probability_min_samples: 32,
            max_onsite_cache_slots_for_instanceof: 0,
            supports_inlining_of_is_instance: true,
            disable_ch_opts: false,
            group_osr_assumptions: true,
            invalidate_mutable_call_site_guards: true,
            nop_breakpoint_guards: true,
            prefer_method_test_at_startup: false,
            max_compile_threads: 8,
        }
    }
}

impl JitOptions {
    /// Parse options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let options: JitOptions = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Failed to parse options: {}", e)))?;
        options.validate()
    }

    /// Load options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    fn validate(self) -> Result<Self> {
        if self.max_compile_threads == 0 || self.max_compile_threads > MAX_COMPILE_THREADS {
            return Err(Error::config(format!(
                "max_compile_threads must be in 1..={}, got {}",
                MAX_COMPILE_THREADS, self.max_compile_threads
            )));
        }
        for (name, value) in [
            ("min_profiled_call_frequency", self.min_profiled_call_frequency),
            ("min_profiled_checkcast_frequency", self.min_profiled_checkcast_frequency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        Ok(self)
    }
}
