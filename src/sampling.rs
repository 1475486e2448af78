//! Repetition penalties and temperature / top-k / top-p sampling.

use std::collections::HashMap;

use extend::ext;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::tokenizer::TokenId;

pub const MIN_TEMPERATURE: f32 = 0.01;
pub const MAX_TOP_P: f32 = 0.999;

/// Sampling parameters. Every setter clamps into the supported range:
/// temperature ≥ 0.01, top-k ≥ 1, top-p in [0, 0.999], penalties ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            frequency_penalty: 0.3,
            presence_penalty: 0.3,
        }
    }
}

fn clamp_temperature(value: f32) -> f32 {
    if value.is_nan() {
        MIN_TEMPERATURE
    } else {
        value.max(MIN_TEMPERATURE)
    }
}

fn clamp_top_p(value: f32) -> f32 {
    if value.is_nan() {
        MAX_TOP_P
    } else {
        value.clamp(0.0, MAX_TOP_P)
    }
}

fn clamp_penalty(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}

impl SamplingConfig {
    pub fn new(
        temperature: f32,
        top_k: usize,
        top_p: f32,
        frequency_penalty: f32,
        presence_penalty: f32,
    ) -> Self {
        Self {
            temperature,
            top_k,
            top_p,
            frequency_penalty,
            presence_penalty,
        }
        .clamped()
    }

    /// Effectively greedy: always the highest-scoring id.
    pub fn greedy() -> Self {
        Self::new(MIN_TEMPERATURE, 1, MAX_TOP_P, 0.0, 0.0)
    }

    pub fn clamped(self) -> Self {
        Self {
            temperature: clamp_temperature(self.temperature),
            top_k: self.top_k.max(1),
            top_p: clamp_top_p(self.top_p),
            frequency_penalty: clamp_penalty(self.frequency_penalty),
            presence_penalty: clamp_penalty(self.presence_penalty),
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn frequency_penalty(&self) -> f32 {
        self.frequency_penalty
    }

    pub fn presence_penalty(&self) -> f32 {
        self.presence_penalty
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = clamp_temperature(temperature);
    }

    pub fn set_top_k(&mut self, top_k: usize) {
        self.top_k = top_k.max(1);
    }

    pub fn set_top_p(&mut self, top_p: f32) {
        self.top_p = clamp_top_p(top_p);
    }

    pub fn set_frequency_penalty(&mut self, penalty: f32) {
        self.frequency_penalty = clamp_penalty(penalty);
    }

    pub fn set_presence_penalty(&mut self, penalty: f32) {
        self.presence_penalty = clamp_penalty(penalty);
    }
}

#[ext(name = ScoresExt)]
pub impl [f32] {
    /// Numerically stable softmax. All-`-inf` input gives a uniform distribution;
    /// `+inf` entries share all of the mass.
    fn softmax(&self) -> Vec<f32> {
        let max = self.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max == f32::INFINITY {
            let infinite = self.iter().filter(|score| **score == f32::INFINITY).count();
            return self
                .iter()
                .map(|score| {
                    if *score == f32::INFINITY {
                        1.0 / infinite as f32
                    } else {
                        0.0
                    }
                })
                .collect();
        }
        if !max.is_finite() {
            return vec![1.0 / self.len() as f32; self.len()];
        }

        let exps: Vec<f32> = self.iter().map(|score| (score - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|value| value / sum).collect()
    }

    /// Largest absolute element-wise difference over the common prefix.
    /// NaN facing a number, or infinities of different sign, count as an
    /// infinite difference; matching NaNs or infinities count as none.
    fn max_abs_diff(&self, other: &[f32]) -> f32 {
        self.iter()
            .zip(other)
            .map(|(a, b)| match (a.is_nan(), b.is_nan()) {
                (true, true) => 0.0,
                (true, false) | (false, true) => f32::INFINITY,
                _ if a == b => 0.0,
                _ => (a - b).abs(),
            })
            .fold(0.0, f32::max)
    }
}

/// Subtracts `frequency_penalty * count + presence_penalty` from the score of
/// every id generated so far. Ids outside the score row are ignored.
pub fn apply_penalties(
    scores: &mut [f32],
    occurrences: &HashMap<TokenId, usize>,
    config: &SamplingConfig,
) {
    for (&id, &count) in occurrences {
        if count == 0 {
            continue;
        }
        let Some(score) = usize::try_from(id).ok().and_then(|index| scores.get_mut(index)) else {
            continue;
        };

        #[allow(clippy::cast_precision_loss)]
        let penalty = config.frequency_penalty * count as f32 + config.presence_penalty;
        *score -= penalty;
    }
}

/// Draws the next id from a score row.
///
/// Scores are divided by the temperature and ranked; the top-k survive, then
/// the shortest prefix of those whose softmax mass reaches top-p. The draw uses
/// the renormalized distribution over what is left. Returns `None` for an
/// empty row.
pub fn sample<R: Rng + ?Sized>(scores: &[f32], config: &SamplingConfig, rng: &mut R) -> Option<TokenId> {
    if scores.is_empty() {
        return None;
    }

    let mut ranked: Vec<(usize, f32)> = scores
        .iter()
        .map(|score| {
            let scaled = score / config.temperature;
            if scaled.is_nan() {
                f32::NEG_INFINITY
            } else {
                scaled
            }
        })
        .enumerate()
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(config.top_k);

    let kept: Vec<f32> = ranked.iter().map(|(_, score)| *score).collect();
    let mut cutoff = kept.len();
    if config.top_p < 1.0 {
        let mut cumulative = 0.0;
        for (i, probability) in kept.softmax().into_iter().enumerate() {
            cumulative += probability;
            if cumulative >= config.top_p {
                cutoff = i + 1;
                break;
            }
        }
    }

    let probabilities = kept[..cutoff].softmax();
    let draw: f32 = rng.random();

    let mut cumulative = 0.0;
    for (i, probability) in probabilities.iter().enumerate() {
        cumulative += probability;
        if draw < cumulative {
            return Some(ranked[i].0 as TokenId);
        }
    }

    ranked.get(cutoff - 1).map(|(index, _)| *index as TokenId)
}
