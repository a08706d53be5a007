// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Binding configuration.
//!
//! Options come from TOML (a string or a file) and may be overridden by
//! `GCBRIDGE_*` environment variables. Engine options are kept as plain
//! strings and handed to the engine builder untouched.
//!
//! ```toml
//! barrier = "field"
//! compressed_pointers = true
//! class_unloading = true
//!
//! [mmtk]
//! plan = "Immix"
//! threads = "4"
//! ```

use crate::error::BindingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

const ENV_PREFIX: &str = "GCBRIDGE_";
const ENV_ENGINE_PREFIX: &str = "GCBRIDGE_MMTK_";

/// Default edge-buffer capacity, matching the engine's root packet size.
pub const DEFAULT_ROOT_BUFFER_CAPACITY: usize = 4096;

/// Which barrier the compiler tiers emit. Chosen once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierSelector {
    /// No barrier; only valid for collectors that never run concurrently
    /// with mutators and keep no remembered set.
    #[default]
    None,
    /// Generational object-logging post-barrier.
    Object,
    /// Snapshot-at-the-beginning field-logging pre-barrier.
    Field,
}

impl FromStr for BarrierSelector {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "no" => Ok(Self::None),
            "object" | "object_logging" => Ok(Self::Object),
            "field" | "field_logging" => Ok(Self::Field),
            other => Err(BindingError::Config(format!("unknown barrier `{other}`"))),
        }
    }
}

/// Liveness test used when weak roots are updated after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeakProcessingMode {
    /// Live means reached by the trace.
    #[default]
    Tracing,
    /// Live means a non-zero reference count, or forwarded.
    ReferenceCounting,
}

impl FromStr for WeakProcessingMode {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracing" => Ok(Self::Tracing),
            "reference_counting" | "rc" => Ok(Self::ReferenceCounting),
            other => Err(BindingError::Config(format!(
                "unknown weak processing mode `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BindingOptions {
    pub barrier: BarrierSelector,

    /// Fields hold 32-bit encoded references.
    pub compressed_pointers: bool,

    /// Capacity of edge buffers the binding allocates itself.
    pub root_buffer_capacity: usize,

    /// Collections may unload classes; weak class-loader edges are dropped.
    pub class_unloading: bool,

    /// Scan independent root categories on the rayon pool.
    pub parallel_root_scan: bool,

    /// The collector moves objects, so compiled code needs relocation fixups.
    pub relocate_code: bool,

    pub weak_processing: WeakProcessingMode,

    /// Passed verbatim to the engine builder.
    pub mmtk: BTreeMap<String, String>,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            barrier: BarrierSelector::default(),
            compressed_pointers: false,
            root_buffer_capacity: DEFAULT_ROOT_BUFFER_CAPACITY,
            class_unloading: true,
            parallel_root_scan: false,
            relocate_code: false,
            weak_processing: WeakProcessingMode::default(),
            mmtk: BTreeMap::new(),
        }
    }
}

impl BindingOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, BindingError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BindingError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Defaults, then the process environment.
    pub fn from_env() -> Result<Self, BindingError> {
        let mut options = Self::default();
        options.apply_env(std::env::vars())?;
        Ok(options)
    }

    /// Apply `GCBRIDGE_*` overrides from `vars`. Unrelated variables are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), BindingError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            if let Some(engine_key) = key.strip_prefix(ENV_ENGINE_PREFIX) {
                self.mmtk
                    .insert(engine_key.to_ascii_lowercase(), value.to_string());
                continue;
            }
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "BARRIER" => self.barrier = value.parse()?,
                "COMPRESSED_POINTERS" => self.compressed_pointers = parse_flag(name, value)?,
                "ROOT_BUFFER_CAPACITY" => {
                    self.root_buffer_capacity = value.trim().parse().map_err(|_| {
                        BindingError::Config(format!("{name} must be an integer, got `{value}`"))
                    })?
                }
                "CLASS_UNLOADING" => self.class_unloading = parse_flag(name, value)?,
                "PARALLEL_ROOT_SCAN" => self.parallel_root_scan = parse_flag(name, value)?,
                "RELOCATE_CODE" => self.relocate_code = parse_flag(name, value)?,
                "WEAK_PROCESSING" => self.weak_processing = value.parse()?,
                other => {
                    tracing::warn!(target: "gcbridge", variable = other, "ignoring unknown option");
                }
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), BindingError> {
        if self.root_buffer_capacity == 0 {
            return Err(BindingError::Config(
                "root_buffer_capacity must be at least 1".into(),
            ));
        }
        if self.weak_processing == WeakProcessingMode::ReferenceCounting
            && self.barrier != BarrierSelector::Field
        {
            return Err(BindingError::Config(
                "reference-counting weak processing requires the field barrier".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, BindingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BindingError::Config(format!(
            "{name} must be a boolean, got `{value}`"
        ))),
    }
}
