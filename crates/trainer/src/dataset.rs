use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};
use tokenizer::LatexTokenizer;

use crate::config::RunConfig;
use crate::error::{Result, TrainError};

/// One optimization step worth of paired images and token sequences.
pub struct Batch {
    /// [batch, seq] token ids, `[BOS] ... [EOS]` right-padded.
    pub tokens: Tensor,
    /// [batch, seq] true where `tokens` is not padding.
    pub mask: Tensor,
    /// [batch, channels, height, width]
    pub images: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tokens.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Right-pads `seqs` with `pad` to the longest sequence.
pub fn pad_sequences(seqs: &[Vec<i64>], pad: i64) -> (Tensor, Tensor) {
    let width = seqs.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(seqs.len() * width);
    for seq in seqs {
        flat.extend_from_slice(seq);
        flat.extend(std::iter::repeat(pad).take(width - seq.len()));
    }
    let tokens = Tensor::from_slice(&flat).view([seqs.len() as i64, width as i64]);
    let mask = tokens.ne(pad);
    (tokens, mask)
}

/// Yields batches for one epoch at a time, in the order they should be trained on.
pub trait BatchSource {
    fn num_batches(&self) -> usize;

    /// Tokenizer that produced the batches, used to decode samples.
    fn tokenizer(&self) -> Arc<LatexTokenizer>;

    /// Batches of epoch `epoch`. The order depends only on the epoch index,
    /// so a resumed run sees the same batches as an uninterrupted one.
    fn iter_epoch(&mut self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

struct Sample {
    image: PathBuf,
    formula: String,
}

/// Formula/image pairs read from `{data}/formulas.txt` and `{data}/images/`.
///
/// Image `images/0000042.png` belongs to line 42 of `formulas.txt`. Images are
/// grouped by padded size so each batch stacks into a single tensor.
pub struct FormulaDataset {
    tokenizer: Arc<LatexTokenizer>,
    samples: Vec<Sample>,
    buckets: BTreeMap<(i64, i64), Vec<usize>>,
    batch_size: usize,
    keep_smaller_batches: bool,
    shuffle: bool,
    channels: i64,
    patch_size: i64,
    max_seq_len: usize,
    pad: i64,
    seed: u64,
}

impl FormulaDataset {
    pub fn load(config: &RunConfig, tokenizer: Arc<LatexTokenizer>) -> Result<Self> {
        let vocab = tokenizer.vocab();
        if (vocab.pad_id(), vocab.bos_id(), vocab.eos_id())
            != (config.pad_token, config.bos_token, config.eos_token)
        {
            return Err(TrainError::config(format!(
                "special tokens pad/bos/eos {}/{}/{} do not match the vocabulary",
                config.pad_token, config.bos_token, config.eos_token
            )));
        }
        if (vocab.len() as i64) > config.num_tokens {
            return Err(TrainError::config(format!(
                "vocabulary of {} tokens exceeds num_tokens {}",
                vocab.len(),
                config.num_tokens
            )));
        }

        let formulas_path = config.data.join("formulas.txt");
        let formulas =
            fs::read_to_string(&formulas_path).map_err(|e| TrainError::io(&formulas_path, e))?;
        let image_dir = config.data.join("images");

        let mut samples = Vec::new();
        let mut buckets: BTreeMap<(i64, i64), Vec<usize>> = BTreeMap::new();
        let mut skipped = 0usize;
        for (index, formula) in formulas.lines().enumerate() {
            let formula = formula.trim();
            let image = image_dir.join(format!("{index:07}.png"));
            if formula.is_empty() || !image.exists() {
                skipped += 1;
                continue;
            }
            let (height, width) = image_size(&image)?;
            let padded = (
                round_up(height, config.patch_size),
                round_up(width, config.patch_size),
            );
            if padded.0 > config.max_height || padded.1 > config.max_width {
                skipped += 1;
                continue;
            }
            buckets.entry(padded).or_default().push(samples.len());
            samples.push(Sample {
                image,
                formula: formula.to_string(),
            });
        }
        if skipped > 0 {
            log::warn!("skipped {} formulas without a usable image", skipped);
        }

        let dataset = Self {
            tokenizer,
            samples,
            buckets,
            batch_size: config.batch_size,
            keep_smaller_batches: config.keep_smaller_batches,
            shuffle: config.shuffle,
            channels: config.channels,
            patch_size: config.patch_size,
            max_seq_len: config.max_seq_len as usize,
            pad: config.pad_token,
            seed: config.seed,
        };
        if dataset.num_batches() == 0 {
            return Err(TrainError::Data(format!(
                "no complete batch of {} in {:?}",
                config.batch_size, config.data
            )));
        }
        log::info!(
            "loaded {} samples in {} size buckets, {} batches per epoch",
            dataset.samples.len(),
            dataset.buckets.len(),
            dataset.num_batches()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn epoch_plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut plan = Vec::with_capacity(self.num_batches());
        for indices in self.buckets.values() {
            let mut indices = indices.clone();
            if self.shuffle {
                indices.shuffle(&mut rng);
            }
            for chunk in indices.chunks(self.batch_size) {
                if chunk.len() == self.batch_size || self.keep_smaller_batches {
                    plan.push(chunk.to_vec());
                }
            }
        }
        if self.shuffle {
            plan.shuffle(&mut rng);
        }
        plan
    }

    fn make_batch(&self, indices: &[usize]) -> Result<Batch> {
        let mut images = Vec::with_capacity(indices.len());
        let mut seqs = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = &self.samples[index];
            images.push(load_image(&sample.image, self.channels, self.patch_size)?);
            seqs.push(
                self.tokenizer
                    .encode_for_training(&sample.formula, self.max_seq_len),
            );
        }
        let (tokens, mask) = pad_sequences(&seqs, self.pad);
        Ok(Batch {
            tokens,
            mask,
            images: Tensor::stack(&images, 0),
        })
    }
}

impl BatchSource for FormulaDataset {
    fn num_batches(&self) -> usize {
        self.buckets
            .values()
            .map(|indices| {
                if self.keep_smaller_batches {
                    indices.len().div_ceil(self.batch_size)
                } else {
                    indices.len() / self.batch_size
                }
            })
            .sum()
    }

    fn tokenizer(&self) -> Arc<LatexTokenizer> {
        Arc::clone(&self.tokenizer)
    }

    fn iter_epoch(&mut self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let plan = self.epoch_plan(epoch);
        Box::new(plan.into_iter().map(move |indices| self.make_batch(&indices)))
    }
}

fn round_up(value: i64, multiple: i64) -> i64 {
    (value + multiple - 1) / multiple * multiple
}

fn image_size(path: &Path) -> Result<(i64, i64)> {
    let image = tch::vision::image::load(path)?;
    let size = image.size();
    Ok((size[1], size[2]))
}

/// Reads an image as `channels` float planes with ink at 1 and background at
/// 0, zero-padded on the bottom and right to a multiple of `patch_size`.
pub fn load_image(path: &Path, channels: i64, patch_size: i64) -> Result<Tensor> {
    let image = tch::vision::image::load(path)?.to_kind(Kind::Float) / 255.0;
    let (c, height, width) = image.size3()?;

    let planes = if channels == c {
        image
    } else if channels == 1 {
        image.mean_dim(Some([0i64].as_slice()), true, Kind::Float)
    } else if c == 1 {
        image.repeat([channels, 1, 1])
    } else if c > channels {
        image.narrow(0, 0, channels)
    } else {
        return Err(TrainError::Data(format!(
            "{path:?} has {c} channels, expected {channels}"
        )));
    };
    let ink = -planes + 1.0;

    let padded = Tensor::zeros(
        [
            channels,
            round_up(height, patch_size),
            round_up(width, patch_size),
        ],
        (Kind::Float, Device::Cpu),
    );
    padded.narrow(1, 0, height).narrow(2, 0, width).copy_(&ink);
    Ok(padded)
}
