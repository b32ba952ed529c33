use regex::Regex;
use std::path::Path;

use crate::error::Result;
use crate::vocab::Vocab;

/// `\command`, an escaped symbol such as `\{`, or any single non-space character.
const LATEX_PATTERN: &str = r"\\[a-zA-Z]+|\\.|\S";

/// Splits LaTeX markup into command/symbol tokens and maps them to ids.
#[derive(Debug, Clone)]
pub struct LatexTokenizer {
    vocab: Vocab,
    pattern: Regex,
}

impl LatexTokenizer {
    pub fn new(vocab: Vocab) -> Result<Self> {
        Ok(Self {
            vocab,
            pattern: Regex::new(LATEX_PATTERN)?,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(Vocab::load(path)?)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.pattern.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Token ids of `text`, unknown tokens mapped to `[UNK]`.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        self.split(text)
            .into_iter()
            .map(|token| self.vocab.get_id(token).unwrap_or(self.vocab.unk_id()))
            .collect()
    }

    /// `[BOS] ids [EOS]`, cut to at most `max_len` ids with `[EOS]` kept last.
    pub fn encode_for_training(&self, text: &str, max_len: usize) -> Vec<i64> {
        let mut ids = Vec::with_capacity(max_len);
        ids.push(self.vocab.bos_id());
        ids.extend(self.encode(text));
        ids.truncate(max_len.saturating_sub(1).max(1));
        ids.push(self.vocab.eos_id());
        ids
    }

    /// Space-joined markup for `ids`. Stops at the first `[EOS]` and drops
    /// `[PAD]` and `[BOS]`.
    pub fn decode(&self, ids: &[i64]) -> String {
        let eos = self.vocab.eos_id();
        let (pad, bos) = (self.vocab.pad_id(), self.vocab.bos_id());
        ids.iter()
            .take_while(|&&id| id != eos)
            .filter(|&&id| id != pad && id != bos)
            .filter_map(|&id| self.vocab.get_token(id))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> LatexTokenizer {
        let mut vocab = Vocab::new();
        for token in ["\\frac", "{", "}", "a", "b", "^", "2", "\\{"] {
            vocab.insert(token);
        }
        LatexTokenizer::new(vocab).unwrap()
    }

    #[test]
    fn splits_commands_and_symbols() {
        let tok = tokenizer();
        assert_eq!(
            tok.split(r"\frac{a}{b^2} \{ x"),
            vec!["\\frac", "{", "a", "}", "{", "b", "^", "2", "}", "\\{", "x"]
        );
    }

    #[test]
    fn unknown_tokens_map_to_unk() {
        let tok = tokenizer();
        let ids = tok.encode("a + b");
        assert_eq!(ids[1], tok.vocab().unk_id());
    }

    #[test]
    fn training_sequence_is_framed_and_bounded() {
        let tok = tokenizer();
        let ids = tok.encode_for_training(r"\frac{a}{b}", 4);
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], tok.vocab().bos_id());
        assert_eq!(*ids.last().unwrap(), tok.vocab().eos_id());

        let short = tok.encode_for_training("a", 10);
        assert_eq!(short.len(), 3);
    }

    #[test]
    fn decode_truncates_at_eos() {
        let tok = tokenizer();
        let mut ids = tok.encode_for_training("a ^ 2", 16);
        ids.extend([tok.vocab().get_id("b").unwrap(), 0, 0]);
        assert_eq!(tok.decode(&ids), "a ^ 2");
    }
}
