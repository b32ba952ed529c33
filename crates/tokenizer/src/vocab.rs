use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, TokenizerError};

pub const PAD: &str = "[PAD]";
pub const BOS: &str = "[BOS]";
pub const EOS: &str = "[EOS]";
pub const UNK: &str = "[UNK]";

/// Reserved tokens, in id order.
pub const SPECIAL_TOKENS: [&str; 4] = [PAD, BOS, EOS, UNK];

/// Dense token table. Ids are positions, the special tokens always take the
/// first ids. Persisted as a JSON array of tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct Vocab {
    tokens: Vec<String>,
    ids: HashMap<String, i64>,
}

impl Vocab {
    pub fn new() -> Self {
        let mut vocab = Self {
            tokens: Vec::new(),
            ids: HashMap::new(),
        };
        for token in SPECIAL_TOKENS {
            vocab.insert(token);
        }
        vocab
    }

    /// Adds `token` if absent and returns its id.
    pub fn insert(&mut self, token: &str) -> i64 {
        if let Some(&id) = self.ids.get(token) {
            return id;
        }
        let id = self.tokens.len() as i64;
        self.tokens.push(token.to_string());
        self.ids.insert(token.to_string(), id);
        id
    }

    pub fn get_id(&self, token: &str) -> Option<i64> {
        self.ids.get(token).copied()
    }

    pub fn get_token(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.tokens.get(i))
            .map(String::as_str)
    }

    pub fn pad_id(&self) -> i64 {
        0
    }

    pub fn bos_id(&self) -> i64 {
        1
    }

    pub fn eos_id(&self) -> i64 {
        2
    }

    pub fn unk_id(&self) -> i64 {
        3
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.tokens
    }
}

impl TryFrom<Vec<String>> for Vocab {
    type Error = TokenizerError;

    fn try_from(tokens: Vec<String>) -> Result<Self> {
        for (i, special) in SPECIAL_TOKENS.iter().enumerate() {
            if tokens.get(i).map(String::as_str) != Some(*special) {
                return Err(TokenizerError::VocabMismatch(format!(
                    "expected {special} at id {i}"
                )));
            }
        }

        let mut ids = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            if ids.insert(token.clone(), i as i64).is_some() {
                return Err(TokenizerError::VocabMismatch(format!(
                    "duplicate token {token}"
                )));
            }
        }
        Ok(Self { tokens, ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_take_first_ids() {
        let vocab = Vocab::new();
        assert_eq!(vocab.get_id(PAD), Some(vocab.pad_id()));
        assert_eq!(vocab.get_id(BOS), Some(vocab.bos_id()));
        assert_eq!(vocab.get_id(EOS), Some(vocab.eos_id()));
        assert_eq!(vocab.get_id(UNK), Some(vocab.unk_id()));
        assert_eq!(vocab.len(), 4);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut vocab = Vocab::new();
        let id = vocab.insert("\\frac");
        assert_eq!(vocab.insert("\\frac"), id);
        assert_eq!(vocab.get_token(id), Some("\\frac"));
        assert_eq!(vocab.get_token(-1), None);
    }

    #[test]
    fn persisted_as_token_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let mut vocab = Vocab::new();
        vocab.insert("x");
        vocab.insert("^");
        vocab.save(&path).unwrap();

        let raw: Vec<String> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 6);
        assert_eq!(Vocab::load(&path).unwrap(), vocab);
    }

    #[test]
    fn rejects_lists_without_specials() {
        let tokens = vec!["x".to_string(), "y".to_string()];
        assert!(matches!(
            Vocab::try_from(tokens),
            Err(TokenizerError::VocabMismatch(_))
        ));
    }
}
