use std::sync::Arc;

use tch::{Device, Kind, Tensor};

use im2latex_core::Seq2Seq;
use tokenizer::LatexTokenizer;

use crate::config::RunConfig;
use crate::dataset::Batch;
use crate::error::Result;
use crate::metrics::MetricSink;

pub const EXAMPLES_KEY: &str = "test/examples";
pub const EXAMPLE_COLUMNS: [&str; 2] = ["Truth", "Prediction"];

#[derive(Debug, Clone, PartialEq)]
pub struct SampleReport {
    pub truths: Vec<String>,
    pub predictions: Vec<String>,
}

impl SampleReport {
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.truths
            .iter()
            .zip(&self.predictions)
            .map(|(truth, prediction)| vec![truth.clone(), prediction.clone()])
            .collect()
    }
}

/// Periodically decodes a few samples of the current batch so progress can be
/// eyeballed. Never touches gradients.
pub struct SamplingMonitor {
    tokenizer: Arc<LatexTokenizer>,
    sample_freq: usize,
    test_samples: usize,
    bos: i64,
    eos: i64,
    max_seq_len: i64,
}

impl SamplingMonitor {
    pub fn new(config: &RunConfig, tokenizer: Arc<LatexTokenizer>) -> Self {
        Self {
            tokenizer,
            sample_freq: config.sample_freq,
            test_samples: config.test_samples,
            bos: config.bos_token,
            eos: config.eos_token,
            max_seq_len: config.max_seq_len,
        }
    }

    pub fn should_sample(&self, step: usize) -> bool {
        (step + 1) % self.sample_freq == 0
    }

    /// Greedy-decodes up to `test_samples` rows of `context` when `step` is a
    /// sampling step. The model is back in training mode on return.
    pub fn maybe_sample<M: Seq2Seq + ?Sized>(
        &self,
        step: usize,
        global_step: usize,
        batch: &Batch,
        context: &Tensor,
        model: &mut M,
        sink: Option<&mut dyn MetricSink>,
    ) -> Result<Option<SampleReport>> {
        if !self.should_sample(step) {
            return Ok(None);
        }

        let n = (context.size()[0]).min(self.test_samples as i64);
        let context = context.narrow(0, 0, n);
        let start = Tensor::full([n, 1], self.bos, (Kind::Int64, context.device()));

        model.set_train(false);
        let generated =
            tch::no_grad(|| model.decoder_generate(&start, self.max_seq_len, self.eos, &context));
        model.set_train(true);

        let report = SampleReport {
            truths: decode_rows(&batch.tokens.narrow(0, 0, n), &self.tokenizer)?,
            predictions: decode_rows(&generated, &self.tokenizer)?,
        };

        match sink {
            Some(sink) => {
                sink.log_table(EXAMPLES_KEY, &EXAMPLE_COLUMNS, &report.rows(), global_step)?
            }
            None => {
                for (truth, prediction) in report.truths.iter().zip(&report.predictions) {
                    println!("Truth:      {truth}");
                    println!("Prediction: {prediction}");
                }
            }
        }
        Ok(Some(report))
    }
}

/// Decodes each row of a [rows, len] id tensor.
pub fn decode_rows(ids: &Tensor, tokenizer: &LatexTokenizer) -> Result<Vec<String>> {
    let (rows, len) = ids.size2()?;
    if rows == 0 || len == 0 {
        return Ok(vec![String::new(); rows as usize]);
    }
    let flat = ids.to_kind(Kind::Int64).to_device(Device::Cpu).view([-1]);
    let flat = Vec::<i64>::try_from(flat)?;
    Ok(flat
        .chunks(len as usize)
        .map(|row| tokenizer.decode(row))
        .collect())
}
