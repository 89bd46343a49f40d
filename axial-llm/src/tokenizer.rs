use anyhow::Result;
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

/// End-of-text markers tried in order when picking the document separator
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: u32,
}

impl Tokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(Self::new(inner))
    }

    fn new(inner: HfTokenizer) -> Self {
        let vocab_size = inner.get_vocab_size(true) as u32;
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .unwrap_or_else(|| vocab_size.saturating_sub(1));
        Self {
            inner,
            eos_token_id,
        }
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Writes `tokenizer.json` next to an exported model.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner
            .save(path, true)
            .map_err(|e| anyhow::anyhow!("{}", e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "hello": 1, "world": 2, "again": 3, "<|endoftext|>": 4},
            "unk_token": "<unk>"
        }
    }"#;

    pub(crate) fn word_level(dir: &Path) -> Tokenizer {
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, WORD_LEVEL).unwrap();
        Tokenizer::from_file(&path).unwrap()
    }

    #[test]
    fn test_encode_and_eos() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = word_level(dir.path());
        assert_eq!(tokenizer.vocab_size(), 5);
        assert_eq!(tokenizer.eos_token_id(), 4);
        assert_eq!(tokenizer.encode("hello world again", false).unwrap(), vec![1, 2, 3]);
        assert_eq!(tokenizer.encode("goodbye", false).unwrap(), vec![0]);
    }

    #[test]
    fn test_save_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = word_level(dir.path());
        let copy = dir.path().join("copy.json");
        tokenizer.save(&copy).unwrap();
        let reloaded = Tokenizer::from_file(&copy).unwrap();
        assert_eq!(reloaded.encode("world hello", false).unwrap(), vec![2, 1]);
    }
}
