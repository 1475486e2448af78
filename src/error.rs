//! Error types for tinybrain

use std::path::PathBuf;

use thiserror::Error;

/// Failure to build a tokenizer or a predictor from a model bundle.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no vocabulary assets found in {0}")]
    MissingAssets(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load score table {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("invalid model parameters: {0}")]
    InvalidModel(String),

    #[error("invalid pre-tokenization pattern: {0}")]
    Pattern(#[from] fancy_regex::Error),
}

/// Errors raised while turning text into token ids.
#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("encoding unsupported: tokenizer was loaded from a decoder table only")]
    DecodeOnly,

    #[error("pre-tokenization failed: {0}")]
    PreTokenize(#[from] fancy_regex::Error),
}

/// Conditions reported back to whoever asked for a generation.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("no tokenizer available")]
    NoTokenizer,

    #[error("input too short or unsupported")]
    EmptyInput,

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

/// Why a fixed-length predictor window could not be built.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("predictor window length is zero")]
    ZeroLength,

    #[error("no tokens to place in the window")]
    EmptyContext,

    #[error("token id {0} does not fit the predictor's int32 input")]
    IdOutOfRange(u64),
}
