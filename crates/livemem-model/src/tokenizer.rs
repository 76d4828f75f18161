//! Byte-level tokenizer used by the command line tools.
//!
//! Every UTF-8 byte is its own token; two special tokens sit above the byte
//! range.  This is a stand-in for a real subword tokenizer and only needs to
//! agree with the model on `vocab_size`.

use livemem_types::TokenId;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const BOS: TokenId = 256;
    pub const EOT: TokenId = 257;
    pub const VOCAB_SIZE: usize = 258;

    /// Encode `text`, optionally prefixed with the beginning-of-sequence token.
    pub fn encode(&self, text: &str, prepend_bos: bool) -> Vec<TokenId> {
        let mut ids = Vec::with_capacity(text.len() + usize::from(prepend_bos));
        if prepend_bos {
            ids.push(Self::BOS);
        }
        ids.extend(text.bytes().map(TokenId::from));
        ids
    }

    /// Decode ids back into text.  Special tokens are skipped and invalid
    /// UTF-8 sequences are replaced.
    pub fn decode(&self, ids: &[TokenId]) -> String {
        let bytes: Vec<u8> = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
