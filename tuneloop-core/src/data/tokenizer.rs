//! Tokenizer seam. Tokenization is a pure text -> token-id transform.

/// Pure text-to-token transform used during preprocessing.
pub trait Tokenizer: Send + Sync {
    fn vocab_size(&self) -> usize;
    fn encode(&self, text: &str) -> Vec<u32>;
}

/// UTF-8 byte-level tokenizer with a 256-entry vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn vocab_size(&self) -> usize {
        256
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }
}
