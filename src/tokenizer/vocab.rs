//! Vocabulary store: token/id tables, merge ranks and special ids loaded from
//! a model bundle directory.
//!
//! A bundle can describe its vocabulary in a few shapes. Each shape is handled
//! by one resolution strategy and the strategies are tried in priority order
//! until one of them produces tables:
//!
//! 1. `tokenizer.json` holding both `model.vocab` and `model.merges`
//! 2. `vocab.json` (or `tinygpt2_vocab.json`) plus `merges.txt` (or `merges`)
//! 3. `token_decoder.json` alone, an id → token table that only supports decoding
//!
//! When `token_decoder.json` is present it also replaces the inverse table of
//! the first two shapes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{MergeRanks, StringPair, Token, TokenId};
use crate::config::read_json;
use crate::error::LoadError;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCAB_FILES: [&str; 2] = ["vocab.json", "tinygpt2_vocab.json"];
pub const MERGES_FILES: [&str; 2] = ["merges.txt", "merges"];
pub const SPECIAL_TOKENS_FILE: &str = "special_tokens_map.json";
pub const DECODER_FILE: &str = "token_decoder.json";

/// Pad id used when the bundle does not name one.
pub const DEFAULT_PAD_ID: TokenId = 0;

/// End-of-sequence id used when the bundle does not name one.
/// This is `<|endoftext|>` in GPT-2 family vocabularies and means nothing
/// for other vocabularies.
pub const DEFAULT_EOS_ID: TokenId = 50256;

/// Token string ↔ id tables.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    encoder: HashMap<Token, TokenId>,
    decoder: HashMap<TokenId, Token>,
}

impl Vocabulary {
    pub fn new(encoder: HashMap<Token, TokenId>, decoder: HashMap<TokenId, Token>) -> Self {
        Self { encoder, decoder }
    }

    /// Builds both directions from a forward table.
    pub fn from_encoder(encoder: HashMap<Token, TokenId>) -> Self {
        let decoder = invert(&encoder);
        Self { encoder, decoder }
    }

    /// A vocabulary that can only decode.
    pub fn from_decoder(decoder: HashMap<TokenId, Token>) -> Self {
        Self {
            encoder: HashMap::new(),
            decoder,
        }
    }

    pub fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.encoder.get(token).copied()
    }

    pub fn id_to_token(&self, id: TokenId) -> Option<&str> {
        self.decoder.get(&id).map(String::as_str)
    }

    pub fn supports_encode(&self) -> bool {
        !self.encoder.is_empty()
    }

    /// Number of ids that can be decoded.
    pub fn len(&self) -> usize {
        self.decoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoder.is_empty()
    }
}

fn invert(encoder: &HashMap<Token, TokenId>) -> HashMap<TokenId, Token> {
    encoder
        .iter()
        .map(|(token, id)| (*id, token.clone()))
        .collect()
}

/// Ids that seed and stop generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub pad: TokenId,
    pub eos: TokenId,
}

impl Default for SpecialIds {
    fn default() -> Self {
        Self {
            pad: DEFAULT_PAD_ID,
            eos: DEFAULT_EOS_ID,
        }
    }
}

/// Which bundle shape the vocabulary was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabularySource {
    Combined,
    Split,
    DecoderOnly,
}

/// Everything the tokenizer needs from a bundle.
#[derive(Debug, Clone)]
pub struct LoadedVocabulary {
    pub vocabulary: Vocabulary,
    pub merges: MergeRanks,
    pub special_ids: SpecialIds,
    pub source: VocabularySource,
}

struct Resolved {
    encoder: HashMap<Token, TokenId>,
    merges: MergeRanks,
}

type DecoderTable = HashMap<TokenId, Token>;

type Strategy = fn(&Path, Option<&DecoderTable>) -> Result<Option<Resolved>, LoadError>;

const STRATEGIES: [(VocabularySource, Strategy); 3] = [
    (VocabularySource::Combined, resolve_combined),
    (VocabularySource::Split, resolve_split),
    (VocabularySource::DecoderOnly, resolve_decoder_only),
];

/// Loads the vocabulary, merge ranks and special ids of a bundle directory.
///
/// A strategy whose files exist but cannot be read falls through to the next
/// one; if no strategy succeeds the last such failure is returned, or
/// [`LoadError::MissingAssets`] when no vocabulary file was found at all.
pub fn load(bundle_dir: &Path) -> Result<LoadedVocabulary, LoadError> {
    let decoder_table = read_decoder_table(bundle_dir);
    let mut last_error = None;

    for (source, strategy) in STRATEGIES {
        let resolved = match strategy(bundle_dir, decoder_table.as_ref()) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => continue,
            Err(err) => {
                warn!(?source, error = %err, "vocabulary strategy failed");
                last_error = Some(err);
                continue;
            }
        };

        let vocabulary = match &decoder_table {
            Some(decoder) => Vocabulary::new(resolved.encoder, decoder.clone()),
            None => Vocabulary::from_encoder(resolved.encoder),
        };
        let special_ids = load_special_ids(bundle_dir, &vocabulary);

        info!(
            ?source,
            tokens = vocabulary.len(),
            merges = resolved.merges.len(),
            pad = special_ids.pad,
            eos = special_ids.eos,
            "loaded vocabulary"
        );

        return Ok(LoadedVocabulary {
            vocabulary,
            merges: resolved.merges,
            special_ids,
            source,
        });
    }

    Err(last_error.unwrap_or_else(|| LoadError::MissingAssets(bundle_dir.to_path_buf())))
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|path| path.is_file())
}

#[derive(Deserialize)]
struct TokenizerFile {
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct TokenizerModel {
    vocab: HashMap<Token, TokenId>,
    merges: Vec<MergeRule>,
}

/// `tokenizer.json` writes merges either as `"a b"` or as `["a", "b"]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum MergeRule {
    Joined(String),
    Pair(String, String),
}

impl MergeRule {
    fn into_pair(self) -> Option<StringPair> {
        match self {
            MergeRule::Joined(rule) => MergeRanks::parse_rule(&rule),
            MergeRule::Pair(left, right) => Some((left, right)),
        }
    }
}

fn resolve_combined(
    dir: &Path,
    _decoder: Option<&DecoderTable>,
) -> Result<Option<Resolved>, LoadError> {
    let path = dir.join(TOKENIZER_FILE);
    if !path.is_file() {
        return Ok(None);
    }

    let TokenizerFile { model } = read_json(&path)?;
    let merges = MergeRanks::from_rules(model.merges.into_iter().filter_map(MergeRule::into_pair));

    Ok(Some(Resolved {
        encoder: model.vocab,
        merges,
    }))
}

fn resolve_split(
    dir: &Path,
    _decoder: Option<&DecoderTable>,
) -> Result<Option<Resolved>, LoadError> {
    let Some(vocab_path) = first_existing(dir, &VOCAB_FILES) else {
        return Ok(None);
    };
    let encoder: HashMap<Token, TokenId> = read_json(&vocab_path)?;

    let merges = match first_existing(dir, &MERGES_FILES) {
        Some(merges_path) => read_merges(&merges_path)?,
        None => {
            warn!(dir = %dir.display(), "no merges file, words will not be merged");
            MergeRanks::default()
        }
    };

    Ok(Some(Resolved { encoder, merges }))
}

fn resolve_decoder_only(
    _dir: &Path,
    decoder: Option<&DecoderTable>,
) -> Result<Option<Resolved>, LoadError> {
    Ok(decoder.map(|_| {
        warn!("only a decoder table is available, encoding is disabled");
        Resolved {
            encoder: HashMap::new(),
            merges: MergeRanks::default(),
        }
    }))
}

/// Reads a merge list, skipping `#` header lines and blank lines.
fn read_merges(path: &Path) -> Result<MergeRanks, LoadError> {
    let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let rules = contents
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .filter_map(|line| {
            let rule = MergeRanks::parse_rule(line);
            if rule.is_none() {
                debug!(line, "skipping malformed merge rule");
            }
            rule
        });

    Ok(MergeRanks::from_rules(rules))
}

/// Reads `token_decoder.json`. An unreadable or empty table counts as absent.
fn read_decoder_table(dir: &Path) -> Option<DecoderTable> {
    let path = dir.join(DECODER_FILE);
    if !path.is_file() {
        return None;
    }

    let raw: HashMap<String, Token> = match read_json(&path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "ignoring decoder table");
            return None;
        }
    };

    let table: DecoderTable = raw
        .into_iter()
        .filter_map(|(id, token)| id.parse::<TokenId>().ok().map(|id| (id, token)))
        .collect();

    (!table.is_empty()).then_some(table)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecialTokenEntry {
    Detailed {
        id: Option<TokenId>,
        content: Option<String>,
    },
    Content(String),
}

impl SpecialTokenEntry {
    fn resolve(&self, vocabulary: &Vocabulary) -> Option<TokenId> {
        match self {
            SpecialTokenEntry::Detailed { id: Some(id), .. } => Some(*id),
            SpecialTokenEntry::Detailed {
                content: Some(content),
                ..
            }
            | SpecialTokenEntry::Content(content) => vocabulary.token_to_id(content),
            SpecialTokenEntry::Detailed { .. } => None,
        }
    }
}

#[derive(Deserialize, Default)]
struct SpecialTokensMap {
    pad_token: Option<SpecialTokenEntry>,
    eos_token: Option<SpecialTokenEntry>,
}

/// Reads pad/eos ids from `special_tokens_map.json`, falling back to
/// [`DEFAULT_PAD_ID`] and [`DEFAULT_EOS_ID`] for anything it does not resolve.
fn load_special_ids(dir: &Path, vocabulary: &Vocabulary) -> SpecialIds {
    let path = dir.join(SPECIAL_TOKENS_FILE);
    let map = if path.is_file() {
        read_json::<SpecialTokensMap>(&path).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring special tokens map");
            SpecialTokensMap::default()
        })
    } else {
        SpecialTokensMap::default()
    };

    let defaults = SpecialIds::default();
    let pad = map.pad_token.as_ref().and_then(|entry| entry.resolve(vocabulary));
    let eos = map.eos_token.as_ref().and_then(|entry| entry.resolve(vocabulary));

    if pad.is_none() || eos.is_none() {
        info!(
            pad_default = pad.is_none(),
            eos_default = eos.is_none(),
            "using default special ids"
        );
    }

    SpecialIds {
        pad: pad.unwrap_or(defaults.pad),
        eos: eos.unwrap_or(defaults.eos),
    }
}
