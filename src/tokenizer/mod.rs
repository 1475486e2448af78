mod bpe;
mod ext;
mod merges;
mod utils;
mod vocab;

pub use bpe::*;
pub use ext::*;
pub use merges::*;
pub use utils::*;
pub use vocab::*;

pub type Token = String;
pub type TokenId = u64;
pub type StringPair = (String, String);

use crate::error::TokenizerError;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, string: &str) -> Result<Vec<TokenId>, TokenizerError>;
    fn decode(&self, tokens: &[TokenId]) -> String;
    fn pad_id(&self) -> TokenId;
    fn eos_id(&self) -> TokenId;
}
