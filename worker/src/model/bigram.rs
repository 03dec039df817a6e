use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    Model,
    adam::Adam,
    error::{ModelErr, Result},
    tensor_values,
    tokenizer::{ByteTokenizer, Tokenizer},
};
use crate::{
    config::ModelShape,
    data::Batch,
    state::{ModelState, NamedTensor, OptimizerState, TensorSet},
};

const WEIGHT: &str = "bigram.weight";
const INIT_SCALE: f32 = 0.01;
/// Weights, gradients and both Adam moments.
const BYTES_PER_PARAM: usize = 4 * size_of::<f32>();

/// Byte-level bigram language model trained with Adam.
///
/// One row of logits per previous token, cross-entropy on the next token.
#[derive(Debug, Clone)]
pub struct BigramModel {
    shape: ModelShape,
    tokenizer: ByteTokenizer,
    vocab: usize,
    weights: Vec<f32>,
    grads: Vec<f32>,
    optimizer: Adam,
    memory_budget: Option<usize>,
}

impl BigramModel {
    /// Creates a model with small random weights drawn from `seed`.
    ///
    /// # Errors
    /// `ModelErr::Shape` if `shape.vocab_size` doesn't match the byte tokenizer.
    pub fn new(shape: &ModelShape, learning_rate: f32, seed: u64) -> Result<Self> {
        let tokenizer = ByteTokenizer;
        let vocab = tokenizer.vocab_size();
        if shape.vocab_size != vocab {
            return Err(ModelErr::Shape {
                what: "vocab size",
                got: shape.vocab_size,
                expected: vocab,
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..vocab * vocab)
            .map(|_| rng.random_range(-INIT_SCALE..INIT_SCALE))
            .collect();

        Ok(Self {
            shape: shape.clone(),
            tokenizer,
            vocab,
            weights,
            grads: vec![0.; vocab * vocab],
            optimizer: Adam::new(vocab * vocab, learning_rate, 0.9, 0.999, 1e-8),
            memory_budget: None,
        })
    }

    /// Caps the memory one step may use, `None` leaves it unbounded.
    ///
    /// # Errors
    /// `ModelErr::OutOfMemory` if the parameters and optimizer state alone
    /// don't fit.
    pub fn with_memory_budget(mut self, budget: Option<u64>) -> Result<Self> {
        self.memory_budget = budget.map(|b| usize::try_from(b).unwrap_or(usize::MAX));
        self.check_memory(self.resident_bytes())?;
        Ok(self)
    }

    /// Bytes a training step over `batch` needs.
    ///
    /// The resident state plus one row of probabilities per byte-level
    /// token, each row capped at the sequence length.
    pub fn step_bytes(&self, batch: &Batch) -> usize {
        let tokens: usize = batch
            .rows
            .iter()
            .map(|row| row.len().min(self.shape.seq_len))
            .sum();
        self.resident_bytes() + tokens * self.vocab * size_of::<f32>()
    }

    fn resident_bytes(&self) -> usize {
        self.weights.len() * BYTES_PER_PARAM
    }

    fn check_memory(&self, requested: usize) -> Result<()> {
        match self.memory_budget {
            Some(available) if requested > available => Err(ModelErr::OutOfMemory {
                requested,
                available,
            }),
            _ => Ok(()),
        }
    }

    pub fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    /// Continues `prompt` by up to `max_tokens` bytes.
    ///
    /// A zero temperature always takes the most likely next token.
    pub fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        rng: &mut StdRng,
    ) -> String {
        let mut tokens = vec![self.tokenizer.bos()];
        tokens.extend(self.tokenizer.encode(prompt));
        let mut probs = vec![0.; self.vocab];

        for _ in 0..max_tokens {
            let last = tokens[tokens.len() - 1] as usize;
            let logits = self.logits(last);

            let next = if temperature <= 0. {
                argmax(logits)
            } else {
                let scaled: Vec<f32> = logits.iter().map(|l| l / temperature).collect();
                softmax(&scaled, &mut probs);
                sample(&probs, rng.random())
            };

            if next as u32 == self.tokenizer.bos() {
                break;
            }
            tokens.push(next as u32);
        }

        self.tokenizer.decode(&tokens)
    }

    fn logits(&self, token: usize) -> &[f32] {
        &self.weights[token * self.vocab..(token + 1) * self.vocab]
    }

    /// `(previous, next)` token pairs of a row, capped at the sequence length.
    fn pairs(&self, row: &str) -> Vec<(usize, usize)> {
        let mut ids = vec![self.tokenizer.bos()];
        ids.extend(self.tokenizer.encode(row));
        ids.truncate(self.shape.seq_len + 1);

        ids.windows(2)
            .map(|w| (w[0] as usize, w[1] as usize))
            .collect()
    }
}

impl Model for BigramModel {
    fn shape(&self) -> &ModelShape {
        &self.shape
    }

    fn num_params(&self) -> usize {
        self.weights.len()
    }

    fn forward_backward(&mut self, batch: &Batch, _rng: &mut StdRng) -> Result<f32> {
        self.check_memory(self.step_bytes(batch))?;
        self.grads.fill(0.);
        let v = self.vocab;
        let mut probs = vec![0.; v];
        let mut total = 0f64;
        let mut count = 0usize;

        for row in &batch.rows {
            for (prev, next) in self.pairs(row) {
                let logits = &self.weights[prev * v..(prev + 1) * v];
                total += f64::from(softmax(logits, &mut probs) - logits[next]);
                count += 1;

                let grads = &mut self.grads[prev * v..(prev + 1) * v];
                grads.iter_mut().zip(&probs).for_each(|(g, p)| *g += p);
                grads[next] -= 1.;
            }
        }

        if count == 0 {
            return Ok(0.);
        }

        let scale = 1. / count as f32;
        self.grads.iter_mut().for_each(|g| *g *= scale);

        let loss = (total / count as f64) as f32;
        if !loss.is_finite() {
            return Err(ModelErr::Compute(format!("loss diverged to {loss}")));
        }

        Ok(loss)
    }

    fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn apply_update(&mut self) -> Result<()> {
        self.optimizer
            .update_params(&self.grads, &mut self.weights)
    }

    fn evaluate(&self, batch: &Batch) -> Result<f32> {
        let mut probs = vec![0.; self.vocab];
        let mut total = 0f64;
        let mut count = 0usize;

        for row in &batch.rows {
            for (prev, next) in self.pairs(row) {
                let logits = self.logits(prev);
                total += f64::from(softmax(logits, &mut probs) - logits[next]);
                count += 1;
            }
        }

        Ok((total / count.max(1) as f64) as f32)
    }

    fn state(&self) -> (ModelState, OptimizerState) {
        let model = TensorSet::new(vec![NamedTensor::new(
            WEIGHT,
            vec![self.vocab, self.vocab],
            self.weights.clone(),
        )]);

        (model, self.optimizer.state())
    }

    fn load_state(&mut self, model: &ModelState, optimizer: &OptimizerState) -> Result<()> {
        let weights = tensor_values(model, WEIGHT, self.weights.len())?;
        self.optimizer.load_state(optimizer)?;
        self.weights.copy_from_slice(weights);
        Ok(())
    }
}

/// Fills `probs` with the softmax of `logits` and returns the log-partition.
fn softmax(logits: &[f32], probs: &mut [f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.;
    for (p, l) in probs.iter_mut().zip(logits) {
        *p = (l - max).exp();
        sum += *p;
    }
    probs.iter_mut().for_each(|p| *p /= sum);

    max + sum.ln()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}

fn sample(probs: &[f32], u: f32) -> usize {
    let mut acc = 0.;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }

    probs.len() - 1
}
