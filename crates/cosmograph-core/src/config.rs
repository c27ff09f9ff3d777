//! Graph construction configuration.
//!
//! ```rust
//! use cosmograph_core::config::{GraphConfig, NeighborSearch};
//!
//! let config = GraphConfig::default()
//!     .with_search(NeighborSearch::Knn { k: 14 })
//!     .with_boundary_threshold(0.03);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Neighbor selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NeighborSearch {
    /// Fixed number of nearest neighbors per particle.
    Knn { k: usize },
    /// Every particle within Euclidean distance `r`.
    Radius { r: f32 },
}

impl NeighborSearch {
    /// Neighbor count per row, if the search guarantees one.
    pub fn fixed_degree(&self) -> Option<usize> {
        match self {
            Self::Knn { k } => Some(*k),
            Self::Radius { .. } => None,
        }
    }
}

/// Configuration for per-sample neighbor graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Neighbor rule (default: K-NN with k = 14).
    pub search: NeighborSearch,
    /// Distance from a face below which a particle is imaged (default: 0.03).
    pub boundary_threshold: f32,
    /// Whether every particle is its own neighbor (default: true).
    pub include_self: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            search: NeighborSearch::Knn { k: 14 },
            boundary_threshold: 0.03,
            include_self: true,
        }
    }
}

impl GraphConfig {
    pub fn with_search(mut self, search: NeighborSearch) -> Self {
        self.search = search;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.search = NeighborSearch::Knn { k };
        self
    }

    pub fn with_radius(mut self, r: f32) -> Self {
        self.search = NeighborSearch::Radius { r };
        self
    }

    pub fn with_boundary_threshold(mut self, threshold: f32) -> Self {
        self.boundary_threshold = threshold;
        self
    }

    pub fn with_include_self(mut self, include_self: bool) -> Self {
        self.include_self = include_self;
        self
    }

    /// Check ranges that the padder and search rely on.
    ///
    /// A threshold of 0.5 or more would flag a coordinate as both near the
    /// lower and the upper face.
    pub fn validate(&self) -> Result<()> {
        let t = self.boundary_threshold;
        if !(t > 0.0 && t < 0.5) {
            return Err(Error::InvalidConfig(format!(
                "boundary_threshold must satisfy 0 < t < 0.5, got {t}"
            )));
        }
        match self.search {
            NeighborSearch::Knn { k } if k == 0 => {
                Err(Error::InvalidConfig("k must be at least 1".into()))
            }
            NeighborSearch::Radius { r } if !(r > 0.0 && r.is_finite()) => Err(
                Error::InvalidConfig(format!("radius must be positive and finite, got {r}")),
            ),
            _ => Ok(()),
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}
