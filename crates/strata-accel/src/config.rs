//! Build configuration.

use crate::error::{AccelError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strata_core::constants::VISIBLE_TO_ALL_RAYS;

/// Settings shared by every build in a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Ray types in the shader binding table; scales every instance's SBT offset.
    pub ray_type_count: u32,
    /// Child count from which instance arrays are encoded in parallel.
    pub parallel_threshold: usize,
    /// Time of the first motion key.
    pub motion_time_begin: f32,
    /// Time of the last motion key.
    pub motion_time_end: f32,
    /// Visibility mask of instances without an explicit mask.
    pub default_visibility_mask: u8,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            ray_type_count: 1,
            parallel_threshold: 8 * 1024,
            motion_time_begin: 0.0,
            motion_time_end: 1.0,
            default_visibility_mask: VISIBLE_TO_ALL_RAYS,
        }
    }
}

impl AccelConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> AccelConfigBuilder {
        AccelConfigBuilder::default()
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.ray_type_count == 0 {
            return Err(AccelError::Configuration(
                "ray_type_count must be at least 1".to_string(),
            ));
        }
        let ordered = matches!(
            self.motion_time_end.partial_cmp(&self.motion_time_begin),
            Some(Ordering::Greater)
        );
        if !ordered {
            return Err(AccelError::Configuration(format!(
                "motion time range [{}, {}] is empty",
                self.motion_time_begin, self.motion_time_end
            )));
        }
        Ok(())
    }
}

/// Builder for [`AccelConfig`].
#[derive(Debug, Default)]
pub struct AccelConfigBuilder {
    config: AccelConfig,
}

impl AccelConfigBuilder {
    /// Set the number of ray types.
    pub const fn ray_type_count(mut self, count: u32) -> Self {
        self.config.ray_type_count = count;
        self
    }

    /// Set the parallel encoding threshold.
    pub const fn parallel_threshold(mut self, children: usize) -> Self {
        self.config.parallel_threshold = children;
        self
    }

    /// Set the motion key time range.
    pub const fn motion_time_range(mut self, begin: f32, end: f32) -> Self {
        self.config.motion_time_begin = begin;
        self.config.motion_time_end = end;
        self
    }

    /// Set the default visibility mask.
    pub const fn default_visibility_mask(mut self, mask: u8) -> Self {
        self.config.default_visibility_mask = mask;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<AccelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
