use std::path::Path;

use cosmos_octree::OctreeConfig;
use cosmos_stream::StreamConfig;
use serde::{Deserialize, Serialize};

/// Errors from loading or saving a universe config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables for universe generation and streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Shared by the universe manager and every galaxy's nested manager.
    pub stream: StreamConfig,
    /// Inclusive range of galaxies scattered in one universe cell.
    pub galaxies_per_cell: (u32, u32),
    /// Inclusive range of star placement attempts in one galaxy sector.
    pub stars_per_sector: (u32, u32),
    /// Scale length of a galaxy's stellar density, in galaxy sector units.
    pub galaxy_radius: f64,
    pub octree: OctreeConfig,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            galaxies_per_cell: (2, 6),
            stars_per_sector: (20, 60),
            galaxy_radius: 4.0,
            octree: OctreeConfig::default(),
        }
    }
}

impl UniverseConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&data)?;
        tracing::debug!(path = %path.as_ref().display(), "universe config loaded");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_preserves_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("universe.json");
        let config = UniverseConfig {
            galaxies_per_cell: (1, 1),
            galaxy_radius: 2.5,
            stream: StreamConfig::synchronous(42),
            ..UniverseConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(UniverseConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.json");
        std::fs::write(&path, r#"{ "stream": { "seed": 7 }, "galaxy_radius": 9.0 }"#).unwrap();

        let config = UniverseConfig::load(&path).unwrap();
        assert_eq!(config.stream.seed, 7);
        assert!(config.stream.async_generation);
        assert_eq!(config.galaxy_radius, 9.0);
        assert_eq!(config.stars_per_sector, UniverseConfig::default().stars_per_sector);
    }

    #[test]
    fn missing_file_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = UniverseConfig::load(tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn malformed_file_is_json_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(UniverseConfig::load(&path), Err(ConfigError::Json(_))));
    }
}
