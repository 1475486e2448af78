//! Autoregressive generation over a fixed-window predictor.
//!
//! Each step builds a window of the most recent ids, asks the predictor for
//! scores, penalizes ids generated so far and samples the next id. The loop
//! stops at the eos id, at the step cap, or as soon as a window cannot be
//! built or the predictor gives nothing usable; whatever was generated up to
//! then is returned.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ndarray::Array2;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::WindowError;
use crate::model::Predictor;
use crate::sampling::{apply_penalties, sample, SamplingConfig, ScoresExt};
use crate::tokenizer::{TokenId, Tokenizer};

/// Number of leading score values compared by the padding probe.
const PROBE_COMPARE_LIMIT: usize = 4096;

/// Scores closer than this count as identical in the padding probe.
const PROBE_TOLERANCE: f32 = 1e-4;

/// Floor for the elapsed time used in the tokens/second metric.
const MIN_ELAPSED_SECS: f64 = 1e-6;

/// Where pad ids go in a window that is not full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    /// Pads first, newest id in the last slot. Used when the predictor
    /// ignores the attention mask.
    Left,
    /// Real ids first, pads after them. Only valid when the predictor honors
    /// the attention mask.
    Right,
}

impl PaddingSide {
    pub fn respects_mask(self) -> bool {
        self == PaddingSide::Right
    }
}

/// One predictor input plus the position whose scores predict the next id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub input_ids: Array2<i32>,
    pub attention_mask: Array2<i32>,
    pub position: usize,
}

/// Places the most recent `length` ids into a `(1, length)` window.
pub fn build_window(
    ids: &[TokenId],
    length: usize,
    pad_id: TokenId,
    side: PaddingSide,
) -> Result<Window, WindowError> {
    if length == 0 {
        return Err(WindowError::ZeroLength);
    }
    if ids.is_empty() {
        return Err(WindowError::EmptyContext);
    }

    let to_input = |id: TokenId| i32::try_from(id).map_err(|_| WindowError::IdOutOfRange(id));
    let recent = &ids[ids.len().saturating_sub(length)..];
    let pad = to_input(pad_id)?;
    let padding = length - recent.len();

    let mut input_ids = Vec::with_capacity(length);
    let mut attention_mask = Vec::with_capacity(length);
    if side == PaddingSide::Left {
        input_ids.resize(padding, pad);
        attention_mask.resize(padding, 0);
    }
    for &id in recent {
        input_ids.push(to_input(id)?);
        attention_mask.push(1);
    }
    if side == PaddingSide::Right {
        input_ids.resize(length, pad);
        attention_mask.resize(length, 0);
    }

    let position = match side {
        PaddingSide::Left => length - 1,
        PaddingSide::Right => recent.len() - 1,
    };

    Ok(Window {
        input_ids: Array2::from_shape_vec((1, length), input_ids)
            .map_err(|_| WindowError::ZeroLength)?,
        attention_mask: Array2::from_shape_vec((1, length), attention_mask)
            .map_err(|_| WindowError::ZeroLength)?,
        position,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The eos id was sampled.
    Eos,
    /// The step cap was reached.
    MaxTokens,
    /// The window for the next step could not be built.
    WindowFailure,
    /// The predictor failed or returned no usable score tensor.
    PredictorFailure,
}

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Ids produced by this call, including a final eos id if one was sampled.
    pub token_ids: Vec<TokenId>,
    /// Decoded text of the generated ids, without the eos id.
    pub text: String,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
}

/// Per-call state: the growing sequence and how often each generated id occurred.
#[derive(Debug, Clone)]
pub struct GenerationState {
    sequence: Vec<TokenId>,
    prompt_len: usize,
    occurrences: HashMap<TokenId, usize>,
}

impl GenerationState {
    pub fn new(prompt: &[TokenId]) -> Self {
        Self {
            sequence: prompt.to_vec(),
            prompt_len: prompt.len(),
            occurrences: HashMap::new(),
        }
    }

    pub fn push(&mut self, id: TokenId) {
        self.sequence.push(id);
        *self.occurrences.entry(id).or_insert(0) += 1;
    }

    pub fn sequence(&self) -> &[TokenId] {
        &self.sequence
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.sequence[self.prompt_len..]
    }

    pub fn occurrences(&self) -> &HashMap<TokenId, usize> {
        &self.occurrences
    }
}

/// Drives a predictor through the generation loop.
///
/// Shared by reference across concurrent calls. The padding side is probed by
/// the first call that needs it and reused afterwards.
pub struct Generator<P> {
    predictor: P,
    padding_side: OnceLock<PaddingSide>,
}

impl<P: Predictor> Generator<P> {
    pub fn new(predictor: P) -> Self {
        Self {
            predictor,
            padding_side: OnceLock::new(),
        }
    }

    /// Skips the padding probe for a predictor whose mask handling is known.
    pub fn with_padding_side(predictor: P, side: PaddingSide) -> Self {
        let generator = Self::new(predictor);
        let _ = generator.padding_side.set(side);
        generator
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    /// The cached padding decision, if one was made.
    pub fn padding_side(&self) -> Option<PaddingSide> {
        self.padding_side.get().copied()
    }

    /// Returns the cached padding side, probing the predictor on first use.
    /// A failed probe falls back to left padding without caching it.
    pub fn resolve_padding_side(&self, pad_id: TokenId) -> PaddingSide {
        if let Some(side) = self.padding_side.get() {
            return *side;
        }

        match self.probe_padding_side(pad_id) {
            Ok(side) => {
                info!(respects_mask = side.respects_mask(), "detected padding side");
                *self.padding_side.get_or_init(|| side)
            }
            Err(err) => {
                warn!(error = %err, "padding probe failed, padding on the left");
                PaddingSide::Left
            }
        }
    }

    /// Runs an all-pad window once fully masked and once fully unmasked. A
    /// predictor that honors the mask answers the two differently.
    fn probe_padding_side(&self, pad_id: TokenId) -> Result<PaddingSide> {
        let length = self.predictor.input_length();
        let pad = i32::try_from(pad_id).context("pad id does not fit int32")?;
        let input_ids = Array2::from_elem((1, length), pad);

        let masked = self
            .predictor
            .predict(&input_ids, &Array2::zeros((1, length)))?;
        let unmasked = self
            .predictor
            .predict(&input_ids, &Array2::ones((1, length)))?;

        let masked = &masked.scores().context("masked probe returned no scores")?.data;
        let unmasked = &unmasked.scores().context("unmasked probe returned no scores")?.data;

        debug!(
            masked = ?masked.shape(),
            masked_dtype = masked.dtype(),
            unmasked = ?unmasked.shape(),
            unmasked_dtype = unmasked.dtype(),
            "comparing padding probe outputs"
        );

        let differs = masked.shape() != unmasked.shape()
            || masked
                .values(0, PROBE_COMPARE_LIMIT)
                .max_abs_diff(&unmasked.values(0, PROBE_COMPARE_LIMIT))
                > PROBE_TOLERANCE;

        Ok(if differs {
            PaddingSide::Right
        } else {
            PaddingSide::Left
        })
    }

    fn next_scores(&self, window: &Window) -> Result<Vec<f32>> {
        let outputs = self
            .predictor
            .predict(&window.input_ids, &window.attention_mask)?;
        let scores = outputs.scores().context("no (1, T, V) score tensor in outputs")?;

        scores.data.score_row(window.position).with_context(|| {
            format!(
                "position {} is outside {} tensor {:?} ({})",
                window.position,
                scores.name,
                scores.data.shape(),
                scores.data.dtype()
            )
        })
    }

    /// Generates up to `max_new_tokens` ids after `prompt` and decodes them.
    pub fn generate<T, R>(
        &self,
        tokenizer: &T,
        prompt: &[TokenId],
        config: &SamplingConfig,
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Generation
    where
        T: Tokenizer + ?Sized,
        R: Rng + ?Sized,
    {
        let side = self.resolve_padding_side(tokenizer.pad_id());
        let length = self.predictor.input_length();
        let eos_id = tokenizer.eos_id();

        let start = Instant::now();
        let mut state = GenerationState::new(prompt);
        let mut stop_reason = StopReason::MaxTokens;

        for step in 0..max_new_tokens {
            let window = match build_window(state.sequence(), length, tokenizer.pad_id(), side) {
                Ok(window) => window,
                Err(err) => {
                    warn!(step, error = %err, "cannot build predictor window");
                    stop_reason = StopReason::WindowFailure;
                    break;
                }
            };

            let mut scores = match self.next_scores(&window) {
                Ok(scores) => scores,
                Err(err) => {
                    warn!(step, error = %err, "predictor failed");
                    stop_reason = StopReason::PredictorFailure;
                    break;
                }
            };

            apply_penalties(&mut scores, state.occurrences(), config);

            let Some(next) = sample(&scores, config, rng) else {
                warn!(step, "predictor returned an empty score row");
                stop_reason = StopReason::PredictorFailure;
                break;
            };

            debug!(step, next, "sampled");
            state.push(next);

            if next == eos_id {
                stop_reason = StopReason::Eos;
                break;
            }
        }

        let elapsed = start.elapsed();
        let token_ids = state.generated().to_vec();
        let text_ids = match token_ids.split_last() {
            Some((last, rest)) if *last == eos_id => rest,
            _ => &token_ids[..],
        };
        let text = tokenizer.decode(text_ids);

        #[allow(clippy::cast_precision_loss)]
        let tokens_per_second =
            token_ids.len() as f64 / elapsed.as_secs_f64().max(MIN_ELAPSED_SECS);

        info!(
            tokens = token_ids.len(),
            ?stop_reason,
            tokens_per_second,
            "generation finished"
        );

        Generation {
            token_ids,
            text,
            stop_reason,
            elapsed,
            tokens_per_second,
        }
    }
}
