use std::path::Path;

use tracing::{info, warn};

use crate::config::GenerationConfig;
use crate::error::{LoadError, RunnerError};
use crate::inference::{Generation, Generator};
use crate::model::{Predictor, TablePredictor};
use crate::tokenizer::{BpeTokenizer, Tokenizer};

/// A loaded model: predictor, tokenizer and the settings generation runs with.
///
/// A model whose tokenizer failed to load can still be inspected, but every
/// `predict` reports [`RunnerError::NoTokenizer`].
pub struct ModelRunner<P> {
    generator: Generator<P>,
    tokenizer: Option<BpeTokenizer>,
    config: GenerationConfig,
}

impl<P: Predictor> ModelRunner<P> {
    pub fn new(predictor: P, tokenizer: Option<BpeTokenizer>, config: GenerationConfig) -> Self {
        Self {
            generator: Generator::new(predictor),
            tokenizer,
            config: config.clamped(),
        }
    }

    pub fn generator(&self) -> &Generator<P> {
        &self.generator
    }

    pub fn tokenizer(&self) -> Option<&BpeTokenizer> {
        self.tokenizer.as_ref()
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.config
    }

    /// Continues `prompt`. Predictor trouble mid-generation is not an error:
    /// the returned [`Generation`] holds what was produced before it.
    pub fn predict(&self, prompt: &str) -> Result<Generation, RunnerError> {
        let tokenizer = self.tokenizer.as_ref().ok_or(RunnerError::NoTokenizer)?;

        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(RunnerError::EmptyInput);
        }

        let ids = tokenizer.encode(prompt)?;
        if ids.is_empty() {
            return Err(RunnerError::EmptyInput);
        }

        let mut rng = self.config.rng();
        Ok(self.generator.generate(
            tokenizer,
            &ids,
            &self.config.sampling,
            self.config.max_new_tokens,
            &mut rng,
        ))
    }

    /// Human-readable facts about the predictor's interface and the tokenizer.
    pub fn metadata(&self) -> Vec<String> {
        let description = self.generator.predictor().describe();

        let mut lines: Vec<String> = description
            .inputs
            .iter()
            .map(|feature| format!("input {}: {}", feature.name, feature.kind))
            .chain(
                description
                    .outputs
                    .iter()
                    .map(|feature| format!("output {}: {}", feature.name, feature.kind)),
            )
            .collect();
        lines.push(format!(
            "window length: {}",
            self.generator.predictor().input_length()
        ));

        match &self.tokenizer {
            Some(tokenizer) => {
                lines.push(format!(
                    "tokenizer: {:?}, {} tokens, {} merges",
                    tokenizer.source(),
                    tokenizer.vocabulary().len(),
                    tokenizer.merges().len()
                ));
                lines.push(format!(
                    "pad id: {}, eos id: {}",
                    tokenizer.pad_id(),
                    tokenizer.eos_id()
                ));
            }
            None => lines.push("tokenizer: unavailable".to_string()),
        }

        if let Some(side) = self.generator.padding_side() {
            lines.push(format!("padding side: {side:?}"));
        }

        lines
    }
}

impl ModelRunner<TablePredictor> {
    /// Loads a bundle directory holding a table predictor. Tokenizer assets
    /// that fail to load leave the runner without a tokenizer.
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        let model_dir = model_dir.as_ref();
        let predictor = TablePredictor::from_dir(model_dir)?;
        let config = GenerationConfig::from_dir(model_dir)?;

        let tokenizer = match BpeTokenizer::from_dir(model_dir) {
            Ok(tokenizer) => Some(tokenizer),
            Err(err) => {
                warn!(dir = %model_dir.display(), error = %err, "no tokenizer available");
                None
            }
        };

        info!(
            dir = %model_dir.display(),
            n_vocab = predictor.config().n_vocab,
            n_ctx = predictor.config().n_ctx,
            "loaded model"
        );

        Ok(Self::new(predictor, tokenizer, config))
    }
}
