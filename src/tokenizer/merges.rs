use std::collections::HashMap;

use super::{get_pairs, StringPair, Token};

/// Lookup table for the rank (priority) of adjacent sub-token merges.
///
/// Lower ranks are merged first. Ranks follow the order of the rule list the
/// table was built from; a repeated rule keeps the rank of its first occurrence.
#[derive(Debug, Clone, Default)]
pub struct MergeRanks {
    ranks: HashMap<StringPair, usize>,
}

impl MergeRanks {
    pub fn from_rules(rules: impl IntoIterator<Item = StringPair>) -> Self {
        let mut ranks = HashMap::new();
        for pair in rules {
            let rank = ranks.len();
            ranks.entry(pair).or_insert(rank);
        }

        Self { ranks }
    }

    /// Parses a `"left right"` merge rule.
    pub fn parse_rule(rule: &str) -> Option<StringPair> {
        let (left, right) = rule.trim_end_matches(&['\r', '\n'][..]).split_once(' ')?;
        if left.is_empty() || right.is_empty() || right.contains(' ') {
            return None;
        }

        Some((left.to_string(), right.to_string()))
    }

    pub fn rank(&self, pair: &StringPair) -> Option<usize> {
        self.ranks.get(pair).copied()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Greedily merges the lowest-ranked adjacent pair of a byte-alphabet
    /// fragment until no known pair remains.
    pub fn merge(&self, fragment: &str) -> Vec<Token> {
        if fragment.is_empty() {
            return Vec::new();
        }

        let mut word: Vec<Token> = fragment.chars().map(String::from).collect();
        if word.len() == 1 || self.ranks.is_empty() {
            return vec![fragment.to_string()];
        }

        while word.len() > 1 {
            let best = get_pairs(&word)
                .into_iter()
                .filter_map(|pair| self.rank(&pair).map(|rank| (rank, pair)))
                .min_by_key(|(rank, _)| *rank);

            let Some((_, (first, second))) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }
}
