use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::latex::LatexTokenizer;
use crate::vocab::Vocab;

/// Builds a vocabulary from formula corpora by token frequency.
pub struct VocabBuilder {
    min_frequency: u32,
    max_size: Option<usize>,
}

impl VocabBuilder {
    pub fn new(min_frequency: u32, max_size: Option<usize>) -> Self {
        Self {
            min_frequency,
            max_size,
        }
    }

    pub fn count(&self, lines: &[String]) -> Result<HashMap<String, u32>> {
        let splitter = LatexTokenizer::new(Vocab::new())?;
        let counts = lines
            .par_iter()
            .fold(HashMap::new, |mut counts: HashMap<String, u32>, line| {
                for token in splitter.split(line) {
                    *counts.entry(token.to_string()).or_insert(0) += 1;
                }
                counts
            })
            .reduce(HashMap::new, |mut a, b| {
                for (token, n) in b {
                    *a.entry(token).or_insert(0) += n;
                }
                a
            });
        Ok(counts)
    }

    /// Most frequent first, ties broken alphabetically so builds are reproducible.
    pub fn build_from_lines(&self, lines: &[String]) -> Result<Vocab> {
        let mut ranked: Vec<(String, u32)> = self
            .count(lines)?
            .into_iter()
            .filter(|(_, n)| *n >= self.min_frequency)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut vocab = Vocab::new();
        for (token, _) in ranked {
            if self.max_size.is_some_and(|max| vocab.len() >= max) {
                break;
            }
            vocab.insert(&token);
        }
        log::info!("built vocabulary of {} tokens", vocab.len());
        Ok(vocab)
    }

    pub fn build<P: AsRef<Path>>(&self, files: &[P]) -> Result<Vocab> {
        let mut lines = Vec::new();
        for path in files {
            let text = fs::read_to_string(path)?;
            lines.extend(text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
        }
        self.build_from_lines(&lines)
    }
}
