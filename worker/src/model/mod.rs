pub mod adam;
pub mod bigram;
pub mod error;
pub mod tokenizer;

use rand::rngs::StdRng;

pub use adam::Adam;
pub use bigram::BigramModel;
pub use error::{ModelErr, Result};
pub use tokenizer::{ByteTokenizer, Tokenizer};

use crate::{
    config::ModelShape,
    data::Batch,
    state::{ModelState, OptimizerState, TensorSet},
};

/// What the training loop needs from a model and its optimizer.
///
/// Gradients live inside the model between `forward_backward` and
/// `apply_update` so the loop can average them across the group in place.
pub trait Model: Send + 'static {
    fn shape(&self) -> &ModelShape;

    fn num_params(&self) -> usize;

    /// Computes the loss of `batch` and leaves its gradients in `grads_mut`.
    ///
    /// # Errors
    /// Every `ModelErr` is fatal for the run.
    fn forward_backward(&mut self, batch: &Batch, rng: &mut StdRng) -> Result<f32>;

    fn grads_mut(&mut self) -> &mut [f32];

    /// Steps the optimizer with the current gradients.
    fn apply_update(&mut self) -> Result<()>;

    /// Loss of `batch` without touching gradients.
    fn evaluate(&self, batch: &Batch) -> Result<f32>;

    fn state(&self) -> (ModelState, OptimizerState);

    fn load_state(&mut self, model: &ModelState, optimizer: &OptimizerState) -> Result<()>;
}

/// Values of tensor `name`, which must hold exactly `len` of them.
pub(crate) fn tensor_values<'a>(set: &'a TensorSet, name: &str, len: usize) -> Result<&'a [f32]> {
    let tensor = set
        .get(name)
        .ok_or_else(|| ModelErr::MissingTensor(name.to_string()))?;

    if tensor.values.len() != len {
        return Err(ModelErr::Shape {
            what: "restored tensor",
            got: tensor.values.len(),
            expected: len,
        });
    }

    Ok(&tensor.values)
}
