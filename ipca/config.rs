use super::model::ModelDims;
use super::source::{Observations, SourceError, load_observations_csv, synthetic_observations};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write run configuration: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML run configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize run configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid run configuration: {0}")]
    Invalid(String),
}

/// Shape of the model being fitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    pub features: usize,
    pub components: usize,
    pub block_width: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    pub workers: usize,
    pub output_dir: PathBuf,
    /// Bootstrap from the first `components` observations before streaming.
    #[serde(default)]
    pub initialize: bool,
}

/// Where the observations come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataSection {
    Synthetic {
        observations: usize,
        latent_rank: usize,
        #[serde(default)]
        noise: f64,
        #[serde(default)]
        seed: u64,
    },
    Csv {
        path: PathBuf,
    },
}

/// A complete streaming run, as read from a TOML file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelSection,
    pub run: RunSection,
    pub data: DataSection,
}

impl RunConfig {
    /// Loads and validates a run configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dims()?;
        if self.run.workers == 0 {
            return Err(ConfigError::Invalid(
                "run.workers must be at least one".to_string(),
            ));
        }
        if let DataSection::Synthetic {
            observations,
            latent_rank,
            noise,
            ..
        } = &self.data
        {
            if *observations == 0 {
                return Err(ConfigError::Invalid(
                    "data.observations must be at least one".to_string(),
                ));
            }
            if *latent_rank == 0 {
                return Err(ConfigError::Invalid(
                    "data.latent_rank must be at least one".to_string(),
                ));
            }
            if !(noise.is_finite() && *noise >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "data.noise must be finite and non-negative, got {noise}"
                )));
            }
        }
        Ok(())
    }

    pub fn dims(&self) -> Result<ModelDims, ConfigError> {
        ModelDims::new(
            self.model.features,
            self.model.components,
            self.model.block_width,
        )
        .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Materializes the configured observations. Relative CSV paths are taken
    /// as relative to the working directory.
    pub fn load_observations(&self) -> Result<Observations, SourceError> {
        match &self.data {
            DataSection::Synthetic {
                observations,
                latent_rank,
                noise,
                seed,
            } => synthetic_observations(
                self.model.features,
                *observations,
                *latent_rank,
                *noise,
                *seed,
            ),
            DataSection::Csv { path } => load_observations_csv(path),
        }
    }
}
