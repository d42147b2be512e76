//! Parameter registry: logical measurement names bound to box channels.
//!
//! The registry is built once from configuration and never mutated while a
//! session runs. Sessions and readers share it through an `Arc` without any
//! locking.

use crate::error::{AppResult, ProbeError};
use crate::protocol::{BoxId, CHANNELS_PER_BOX};
use crate::store::ProbeStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

/// Binding of one logical parameter to channels of a single box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    /// Parameter name (unique identifier)
    pub name: String,
    /// Box answering for this parameter
    #[serde(rename = "box")]
    pub box_id: BoxId,
    /// Bound channels, reported as parallel values in this order
    pub channels: Vec<u8>,
    /// Lower classification bound (mm)
    #[serde(default = "default_lower")]
    pub lower: f64,
    /// Upper classification bound (mm)
    #[serde(default = "default_upper")]
    pub upper: f64,
}

fn default_lower() -> f64 {
    f64::NEG_INFINITY
}

fn default_upper() -> f64 {
    f64::INFINITY
}

impl ParameterBinding {
    /// Bind `name` to a single channel with no classification limits.
    pub fn new(name: impl Into<String>, box_id: BoxId, channel: u8) -> Self {
        Self {
            name: name.into(),
            box_id,
            channels: vec![channel],
            lower: default_lower(),
            upper: default_upper(),
        }
    }

    /// Bind additional channels of the same box.
    pub fn with_channels(mut self, channels: Vec<u8>) -> Self {
        self.channels = channels;
        self
    }

    /// Set classification limits.
    pub fn with_limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Classify one value against the limits.
    pub fn classify(&self, value: f64) -> ProbeStatus {
        if !value.is_finite() {
            ProbeStatus::Error
        } else if value < self.lower {
            ProbeStatus::Under
        } else if value > self.upper {
            ProbeStatus::Over
        } else {
            ProbeStatus::InRange
        }
    }

    /// Classify parallel values; the first channel out of range decides.
    pub fn classify_all(&self, values: &[f64]) -> ProbeStatus {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return ProbeStatus::Error;
        }
        values
            .iter()
            .map(|&v| self.classify(v))
            .find(|status| *status != ProbeStatus::InRange)
            .unwrap_or(ProbeStatus::InRange)
    }

    /// Channels outside 1..=4.
    pub fn invalid_channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels
            .iter()
            .copied()
            .filter(|&c| c == 0 || usize::from(c) > CHANNELS_PER_BOX)
    }
}

/// Read-only lookup of parameter bindings by box.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    bindings: Vec<ParameterBinding>,
    by_box: BTreeMap<BoxId, Vec<ParameterBinding>>,
}

impl ParameterRegistry {
    /// Build a registry from bindings.
    ///
    /// Duplicate names and empty channel lists are rejected. Channels outside
    /// 1..=4 are accepted with a warning; they surface as channel
    /// configuration faults every tick.
    pub fn new(bindings: Vec<ParameterBinding>) -> AppResult<Self> {
        let mut names = HashSet::new();
        let mut by_box: BTreeMap<BoxId, Vec<ParameterBinding>> = BTreeMap::new();

        for binding in &bindings {
            if !names.insert(binding.name.as_str()) {
                return Err(ProbeError::Configuration(format!(
                    "Duplicate parameter name: {}",
                    binding.name
                )));
            }
            if binding.channels.is_empty() {
                return Err(ProbeError::Configuration(format!(
                    "Parameter '{}' binds no channels",
                    binding.name
                )));
            }
            if binding.lower > binding.upper {
                return Err(ProbeError::Configuration(format!(
                    "Parameter '{}' has lower bound {} above upper bound {}",
                    binding.name, binding.lower, binding.upper
                )));
            }
            for channel in binding.invalid_channels() {
                warn!(
                    parameter = %binding.name,
                    box_id = %binding.box_id,
                    channel,
                    "binding references a channel outside 1..=4"
                );
            }
            by_box
                .entry(binding.box_id)
                .or_default()
                .push(binding.clone());
        }

        Ok(Self { bindings, by_box })
    }

    /// Bindings answered by `box_id`, in configuration order.
    pub fn bindings_for_box(&self, box_id: BoxId) -> &[ParameterBinding] {
        self.by_box.get(&box_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every box referenced by at least one binding, ascending.
    pub fn all_boxes(&self) -> BTreeSet<BoxId> {
        self.by_box.keys().copied().collect()
    }

    /// Look up a binding by parameter name.
    pub fn binding(&self, name: &str) -> Option<&ParameterBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// All bindings in configuration order.
    pub fn bindings(&self) -> &[ParameterBinding] {
        &self.bindings
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no parameter is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Report the first binding that references a channel outside 1..=4.
    ///
    /// Sessions tolerate such bindings; this is for front ends that want to
    /// refuse them up front.
    pub fn check_channels(&self) -> AppResult<()> {
        for binding in &self.bindings {
            if let Some(channel) = binding.invalid_channels().next() {
                return Err(ProbeError::ChannelConfig {
                    parameter: binding.name.clone(),
                    channel,
                });
            }
        }
        Ok(())
    }
}
