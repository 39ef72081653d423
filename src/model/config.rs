//! BResNet configuration
//!
//! Architecture parameters and presets, loadable from TOML files.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::blocks::BottleneckResidual1D;
use crate::error::LayerError;

/// Configuration for the BResNet-1D architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BResNetConfig {
    /// Filters of the three stem convolutions
    pub stem_filters: Vec<usize>,

    /// Number of bottleneck blocks in each stage
    pub stage_blocks: Vec<usize>,

    /// Bottleneck filters of each stage (outputs are 4x wider)
    pub stage_filters: Vec<usize>,

    /// Number of output classes, `None` to return pooled features
    pub num_classes: Option<usize>,
}

impl Default for BResNetConfig {
    fn default() -> Self {
        Self::bresnet161()
    }
}

impl BResNetConfig {
    /// 53 bottleneck blocks: 159 block convolutions plus stem and head
    pub fn bresnet161() -> Self {
        Self {
            stem_filters: vec![32, 32, 64],
            stage_blocks: vec![3, 8, 36, 6],
            stage_filters: vec![64, 128, 256, 512],
            num_classes: None,
        }
    }

    /// ResNet-50 depth
    pub fn bresnet50() -> Self {
        Self {
            stage_blocks: vec![3, 4, 6, 3],
            ..Self::bresnet161()
        }
    }

    /// Small network for quick experiments and tests
    pub fn tiny() -> Self {
        Self {
            stem_filters: vec![4, 4, 8],
            stage_blocks: vec![1, 1, 1, 1],
            stage_filters: vec![2, 4, 8, 16],
            num_classes: None,
        }
    }

    /// Attach a classification head
    pub fn with_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    /// Channels produced by the last stage
    pub fn feature_channels(&self) -> usize {
        self.stage_filters
            .last()
            .map_or(0, |f| f * BottleneckResidual1D::EXPANSION)
    }

    /// Total number of bottleneck blocks
    pub fn num_blocks(&self) -> usize {
        self.stage_blocks.iter().sum()
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), LayerError> {
        if self.stem_filters.len() != 3 {
            return Err(LayerError::InvalidConfig(format!(
                "stem_filters needs 3 entries, got {}",
                self.stem_filters.len()
            )));
        }
        if let Some(&f) = self.stem_filters.iter().find(|&&f| f == 0) {
            return Err(LayerError::InvalidFilters(f));
        }
        if self.stage_blocks.is_empty() {
            return Err(LayerError::InvalidConfig(
                "stage_blocks must not be empty".to_string(),
            ));
        }
        if self.stage_blocks.len() != self.stage_filters.len() {
            return Err(LayerError::InvalidConfig(format!(
                "stage_blocks has {} entries but stage_filters has {}",
                self.stage_blocks.len(),
                self.stage_filters.len()
            )));
        }
        if self.stage_blocks.contains(&0) {
            return Err(LayerError::InvalidConfig(
                "every stage needs at least one block".to_string(),
            ));
        }
        if let Some(&f) = self.stage_filters.iter().find(|&&f| f == 0) {
            return Err(LayerError::InvalidFilters(f));
        }
        if self.num_classes == Some(0) {
            return Err(LayerError::InvalidConfig(
                "num_classes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BResNetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file or use default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
