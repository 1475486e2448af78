//! The next-token predictor the generation loop drives.
//!
//! The network itself lives outside this crate. A predictor takes one
//! fixed-length window of token ids plus its attention mask and answers with a
//! set of named tensors, one of which holds per-position vocabulary scores.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use derive_new::new;
use half::f16;
use ndarray::{s, Array2, Array3, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::read_json;
use crate::error::LoadError;

/// Score tensors narrower than this are unlikely to span a vocabulary.
pub const MIN_VOCAB_DIM: usize = 1000;

/// Tensor contents in the numeric width the predictor produced them.
#[derive(Debug, Clone)]
pub enum TensorData {
    F16(ArrayD<f16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl TensorData {
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::F16(array) => array.shape(),
            TensorData::F32(array) => array.shape(),
            TensorData::F64(array) => array.shape(),
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            TensorData::F16(_) => "float16",
            TensorData::F32(_) => "float32",
            TensorData::F64(_) => "float64",
        }
    }

    /// Shape `(1, T, V)` as `(T, V)`.
    pub fn sequence_dims(&self) -> Option<(usize, usize)> {
        match *self.shape() {
            [1, positions, vocab] if positions > 0 && vocab > 0 => Some((positions, vocab)),
            _ => None,
        }
    }

    /// Reads the `V` scores at `position` of a `(1, T, V)` tensor.
    pub fn score_row(&self, position: usize) -> Option<Vec<f32>> {
        let (positions, vocab) = self.sequence_dims()?;
        if position >= positions {
            return None;
        }

        Some(self.values(position * vocab, vocab))
    }

    /// Up to `limit` values in logical order, starting at flat index `offset`.
    pub fn values(&self, offset: usize, limit: usize) -> Vec<f32> {
        match self {
            TensorData::F16(array) => array.iter().skip(offset).take(limit).map(|v| v.to_f32()).collect(),
            TensorData::F32(array) => array.iter().skip(offset).take(limit).copied().collect(),
            #[allow(clippy::cast_possible_truncation)]
            TensorData::F64(array) => array.iter().skip(offset).take(limit).map(|v| *v as f32).collect(),
        }
    }
}

#[derive(new, Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub data: TensorData,
}

#[derive(new, Debug, Clone, Default)]
pub struct PredictorOutputs {
    pub tensors: Vec<NamedTensor>,
}

impl PredictorOutputs {
    /// The `(1, T, V)` tensor with the widest vocabulary dimension.
    pub fn scores(&self) -> Option<&NamedTensor> {
        let best = self
            .tensors
            .iter()
            .filter_map(|tensor| tensor.data.sequence_dims().map(|(_, vocab)| (vocab, tensor)))
            .fold(None, |best: Option<(usize, &NamedTensor)>, (vocab, tensor)| match best {
                Some((best_vocab, _)) if best_vocab >= vocab => best,
                _ => Some((vocab, tensor)),
            });

        if let Some((vocab, tensor)) = best {
            if vocab < MIN_VOCAB_DIM {
                debug!(
                    name = %tensor.name,
                    dtype = tensor.data.dtype(),
                    vocab,
                    "score tensor is narrower than a typical vocabulary"
                );
            }
        }

        best.map(|(_, tensor)| tensor)
    }
}

/// Name and type of one predictor input or output.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescription {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDescription {
    pub inputs: Vec<FeatureDescription>,
    pub outputs: Vec<FeatureDescription>,
}

pub trait Predictor: Send + Sync {
    /// Number of positions every window passed to [`Predictor::predict`] has.
    fn input_length(&self) -> usize;

    /// Scores one window. Both arrays have shape `(1, input_length)`.
    fn predict(
        &self,
        input_ids: &Array2<i32>,
        attention_mask: &Array2<i32>,
    ) -> Result<PredictorOutputs>;

    fn describe(&self) -> ModelDescription {
        ModelDescription::default()
    }
}

pub const HPARAMS_FILE: &str = "hparams.json";
pub const SCORES_FILE: &str = "next_token_scores.npy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of tokens in the vocabulary.
    pub n_vocab: usize,
    /// Fixed input window length.
    pub n_ctx: usize,
}

impl ModelConfig {
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        read_json(&model_dir.as_ref().join(HPARAMS_FILE))
    }
}

/// A predictor backed by a table of next-token scores, one row per current
/// token. It honors the attention mask: masked positions score zero.
///
/// Bundles ship it as `hparams.json` plus an `n_vocab × n_vocab` float32
/// `next_token_scores.npy`.
#[derive(Debug, Clone)]
pub struct TablePredictor {
    config: ModelConfig,
    scores: Array2<f32>,
}

impl TablePredictor {
    pub fn new(config: ModelConfig, scores: Array2<f32>) -> Result<Self, LoadError> {
        if config.n_ctx == 0 || config.n_vocab == 0 {
            return Err(LoadError::InvalidModel(format!(
                "n_ctx and n_vocab must be positive, got {config:?}"
            )));
        }
        if scores.dim() != (config.n_vocab, config.n_vocab) {
            return Err(LoadError::InvalidModel(format!(
                "score table has shape {:?}, expected ({n}, {n})",
                scores.dim(),
                n = config.n_vocab
            )));
        }

        Ok(Self { config, scores })
    }

    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        let model_dir = model_dir.as_ref();
        let config = ModelConfig::from_dir(model_dir)?;

        let scores_path: PathBuf = model_dir.join(SCORES_FILE);
        let scores: Array2<f32> =
            ndarray_npy::read_npy(&scores_path).map_err(|source| LoadError::Npy {
                path: scores_path.clone(),
                source,
            })?;

        Self::new(config, scores)
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }
}

impl Predictor for TablePredictor {
    fn input_length(&self) -> usize {
        self.config.n_ctx
    }

    fn predict(
        &self,
        input_ids: &Array2<i32>,
        attention_mask: &Array2<i32>,
    ) -> Result<PredictorOutputs> {
        let n_ctx = self.config.n_ctx;
        ensure!(
            input_ids.dim() == (1, n_ctx) && attention_mask.dim() == (1, n_ctx),
            "expected (1, {n_ctx}) inputs, got {:?} and {:?}",
            input_ids.dim(),
            attention_mask.dim()
        );

        let mut logits = Array3::<f32>::zeros((1, n_ctx, self.config.n_vocab));
        for position in 0..n_ctx {
            if attention_mask[[0, position]] == 0 {
                continue;
            }

            let id = input_ids[[0, position]];
            let row = usize::try_from(id)
                .ok()
                .filter(|row| *row < self.config.n_vocab)
                .with_context(|| format!("token id {id} at position {position} is out of range"))?;

            logits
                .slice_mut(s![0, position, ..])
                .assign(&self.scores.row(row));
        }

        Ok(PredictorOutputs::new(vec![NamedTensor::new(
            "logits".to_string(),
            TensorData::F32(logits.into_dyn()),
        )]))
    }

    fn describe(&self) -> ModelDescription {
        let window = format!("int32 [1, {}]", self.config.n_ctx);

        ModelDescription {
            inputs: vec![
                FeatureDescription::new("input_ids".to_string(), window.clone()),
                FeatureDescription::new("attention_mask".to_string(), window),
            ],
            outputs: vec![FeatureDescription::new(
                "logits".to_string(),
                format!("float32 [1, {}, {}]", self.config.n_ctx, self.config.n_vocab),
            )],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::IxDyn;
    use tempfile::tempdir;

    fn table_predictor() -> TablePredictor {
        let config = ModelConfig { n_vocab: 4, n_ctx: 3 };
        let scores = Array2::from_shape_fn((4, 4), |(row, col)| (row * 10 + col) as f32);
        TablePredictor::new(config, scores).unwrap()
    }

    #[test]
    pub fn score_row_converts_half_precision() {
        let data = ArrayD::from_shape_vec(
            IxDyn(&[1, 2, 3]),
            [0.5f32, 1.0, 1.5, 2.0, 2.5, 3.0].map(f16::from_f32).to_vec(),
        )
        .unwrap();
        let tensor = TensorData::F16(data);

        assert_eq!(Some((2, 3)), tensor.sequence_dims());
        assert_eq!(Some(vec![2.0, 2.5, 3.0]), tensor.score_row(1));
        assert_eq!(None, tensor.score_row(2));
    }

    #[test]
    pub fn dtype_names_element_width() {
        let shape = IxDyn(&[1, 1, 2]);

        assert_eq!("float16", TensorData::F16(ArrayD::from_elem(shape.clone(), f16::ZERO)).dtype());
        assert_eq!("float32", TensorData::F32(ArrayD::zeros(shape.clone())).dtype());
        assert_eq!("float64", TensorData::F64(ArrayD::zeros(shape)).dtype());
    }

    #[test]
    pub fn score_row_narrows_double_precision() {
        let data = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![0.25f64, -4.0]).unwrap();

        assert_eq!(Some(vec![0.25, -4.0]), TensorData::F64(data).score_row(0));
    }

    #[test]
    pub fn scores_picks_widest_sequence_tensor() {
        let hidden = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 8]));
        let logits = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 32]));
        let pooled = ArrayD::<f32>::zeros(IxDyn(&[1, 64]));
        let outputs = PredictorOutputs::new(vec![
            NamedTensor::new("hidden".to_string(), TensorData::F32(hidden)),
            NamedTensor::new("pooled".to_string(), TensorData::F32(pooled)),
            NamedTensor::new("logits".to_string(), TensorData::F32(logits)),
        ]);

        assert_eq!("logits", outputs.scores().unwrap().name);
    }

    #[test]
    pub fn scores_requires_a_sequence_tensor() {
        let batch = ArrayD::<f32>::zeros(IxDyn(&[2, 4, 32]));
        let outputs = PredictorOutputs::new(vec![NamedTensor::new(
            "batched".to_string(),
            TensorData::F32(batch),
        )]);

        assert!(outputs.scores().is_none());
        assert!(PredictorOutputs::default().scores().is_none());
    }

    #[test]
    pub fn table_predictor_honors_mask() {
        let predictor = table_predictor();
        let ids = Array2::from_shape_vec((1, 3), vec![2, 1, 0]).unwrap();
        let mask = Array2::from_shape_vec((1, 3), vec![1, 1, 0]).unwrap();

        let outputs = predictor.predict(&ids, &mask).unwrap();
        let scores = &outputs.scores().unwrap().data;

        assert_eq!(Some(vec![20.0, 21.0, 22.0, 23.0]), scores.score_row(0));
        assert_eq!(Some(vec![10.0, 11.0, 12.0, 13.0]), scores.score_row(1));
        assert_eq!(Some(vec![0.0; 4]), scores.score_row(2));
    }

    #[test]
    pub fn table_predictor_rejects_bad_input() {
        let predictor = table_predictor();
        let mask = Array2::ones((1, 3));

        let out_of_range = Array2::from_elem((1, 3), 9);
        assert!(predictor.predict(&out_of_range, &mask).is_err());

        let short = Array2::zeros((1, 2));
        assert!(predictor.predict(&short, &Array2::ones((1, 2))).is_err());
    }

    #[test]
    pub fn table_predictor_validates_shape() {
        let config = ModelConfig { n_vocab: 4, n_ctx: 3 };

        assert!(TablePredictor::new(config, Array2::zeros((4, 3))).is_err());
        assert!(TablePredictor::new(ModelConfig { n_vocab: 4, n_ctx: 0 }, Array2::zeros((4, 4))).is_err());
    }

    #[test]
    pub fn table_predictor_from_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(HPARAMS_FILE), r#"{"n_vocab": 2, "n_ctx": 5}"#).unwrap();
        ndarray_npy::write_npy(dir.path().join(SCORES_FILE), &Array2::<f32>::eye(2)).unwrap();

        let predictor = TablePredictor::from_dir(dir.path()).unwrap();

        assert_eq!(5, predictor.input_length());
        assert_eq!(ModelConfig { n_vocab: 2, n_ctx: 5 }, predictor.config());
        assert_eq!(2, predictor.describe().inputs.len());
    }
}
