use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::sampling::SamplingConfig;

pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Settings for one generation call, optionally shipped with a model bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of generation steps.
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
    /// Fixed seed for reproducible sampling. Drawn from the OS when absent.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            sampling: SamplingConfig::default(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let config: Self = read_json(path.as_ref())?;
        Ok(config.clamped())
    }

    /// Reads `generation_config.json` from a bundle, or the defaults when it has none.
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = model_dir.as_ref().join(GENERATION_CONFIG_FILE);
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn clamped(self) -> Self {
        Self {
            max_new_tokens: self.max_new_tokens.max(1),
            sampling: self.sampling.clamped(),
            seed: self.seed,
        }
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use tempfile::tempdir;

    #[test]
    pub fn missing_file_uses_defaults() {
        let dir = tempdir().unwrap();

        assert_eq!(GenerationConfig::default(), GenerationConfig::from_dir(dir.path()).unwrap());
    }

    #[test]
    pub fn partial_file_is_completed_and_clamped() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(GENERATION_CONFIG_FILE),
            r#"{"max_new_tokens": 0, "sampling": {"temperature": 0.0, "top_k": 5}, "seed": 7}"#,
        )
        .unwrap();

        let config = GenerationConfig::from_dir(dir.path()).unwrap();

        assert_eq!(1, config.max_new_tokens);
        assert_eq!(Some(7), config.seed);
        assert_eq!(0.01, config.sampling.temperature());
        assert_eq!(5, config.sampling.top_k());
        assert_eq!(SamplingConfig::default().top_p(), config.sampling.top_p());
    }

    #[test]
    pub fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = GenerationConfig {
            max_new_tokens: 48,
            seed: Some(3),
            ..GenerationConfig::default()
        };
        config.sampling.set_top_k(12);

        config.save(&path).unwrap();

        assert_eq!(config, GenerationConfig::load(&path).unwrap());
    }

    #[test]
    pub fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(GENERATION_CONFIG_FILE), "[1, 2]").unwrap();

        assert!(matches!(
            GenerationConfig::from_dir(dir.path()),
            Err(LoadError::Json { .. })
        ));
    }

    #[test]
    pub fn seeded_rng_is_reproducible() {
        let config = GenerationConfig {
            seed: Some(11),
            ..GenerationConfig::default()
        };

        let first: Vec<u32> = (0..4).map(|_| config.rng().random()).collect();
        let mut rng = config.rng();
        let second: u32 = rng.random();

        assert_eq!(first[0], second);
        assert!(first.iter().all(|value| *value == first[0]));
    }
}
