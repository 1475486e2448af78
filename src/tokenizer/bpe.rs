use std::path::Path;

use fancy_regex::Regex;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use super::{
    vocab, ByteAlphabetExt, ByteTable, LoadedVocabulary, MergeRanks, SpecialIds, TokenId,
    Tokenizer, Vocabulary, VocabularySource, PRE_TOKENIZE_PATTERN, WORD_BOUNDARY_MARKER,
};
use crate::error::{LoadError, TokenizerError};

/// What encode does with a sub-token that is not in the vocabulary, even
/// after retrying it with a leading word-boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTokenPolicy {
    /// Drop it. Encoding is lossy for such input.
    #[default]
    Skip,
    /// Emit the given id in its place.
    Replace(TokenId),
}

/// Byte-level BPE tokenizer in the GPT-2 style.
pub struct BpeTokenizer {
    vocabulary: Vocabulary,
    merges: MergeRanks,
    special_ids: SpecialIds,
    source: VocabularySource,
    byte_table: ByteTable,
    pattern: Regex,
    unknown_policy: UnknownTokenPolicy,
}

impl BpeTokenizer {
    pub fn new(loaded: LoadedVocabulary) -> Result<Self, LoadError> {
        Ok(Self {
            vocabulary: loaded.vocabulary,
            merges: loaded.merges,
            special_ids: loaded.special_ids,
            source: loaded.source,
            byte_table: ByteTable::new(),
            pattern: Regex::new(PRE_TOKENIZE_PATTERN)?,
            unknown_policy: UnknownTokenPolicy::default(),
        })
    }

    /// Loads the tokenizer assets of a model bundle directory.
    pub fn from_dir(bundle_dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::new(vocab::load(bundle_dir.as_ref())?)
    }

    pub fn with_unknown_policy(mut self, policy: UnknownTokenPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn merges(&self) -> &MergeRanks {
        &self.merges
    }

    pub fn special_ids(&self) -> SpecialIds {
        self.special_ids
    }

    pub fn source(&self) -> VocabularySource {
        self.source
    }

    fn lookup(&self, sub_token: &str) -> Option<TokenId> {
        self.vocabulary.token_to_id(sub_token).or_else(|| {
            self.vocabulary
                .token_to_id(&format!("{WORD_BOUNDARY_MARKER}{sub_token}"))
        })
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, string: &str) -> Result<Vec<TokenId>, TokenizerError> {
        if !self.vocabulary.supports_encode() {
            return Err(TokenizerError::DecodeOnly);
        }

        let mut ids = Vec::new();
        let mut dropped = 0usize;

        for fragment in self.pattern.find_iter(string) {
            let symbols = fragment?.as_str().to_byte_alphabet(&self.byte_table);

            for sub_token in self.merges.merge(&symbols) {
                match (self.lookup(&sub_token), self.unknown_policy) {
                    (Some(id), _) => ids.push(id),
                    (None, UnknownTokenPolicy::Replace(id)) => ids.push(id),
                    (None, UnknownTokenPolicy::Skip) => dropped += 1,
                }
            }
        }

        if dropped > 0 {
            debug!(dropped, "dropped unresolved sub-tokens");
        }

        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        let symbols: String = tokens
            .iter()
            .filter_map(|id| self.vocabulary.id_to_token(*id))
            .collect();

        let bytes = symbols.to_raw_bytes(&self.byte_table);

        String::from_utf8_lossy(&bytes)
            .replace_markers()
            .nfc()
            .collect()
    }

    fn pad_id(&self) -> TokenId {
        self.special_ids.pad
    }

    fn eos_id(&self) -> TokenId {
        self.special_ids.eos
    }
}
