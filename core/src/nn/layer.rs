use crate::nn::context::{InitContext, RunContext};
use crate::nn::error::Result;
use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A trainable layer driven through the resource registry.
///
/// # Lifecycle
///
/// 1. **Configure**: [`Layer::set_property`] with `key=value` strings.
/// 2. **Setup**: [`Layer::finalize`] validates the inputs, requests weights and scratch
///    buffers from the [`InitContext`] and declares the output dimensions.
/// 3. **Run**: for each step, [`Layer::forward`] followed by [`Layer::calc_derivative`]
///    and [`Layer::calc_gradient`] in either order, all against the built [`RunContext`].
///
/// Requiring `Send + Sync` lets a finished layer move between threads; every procedure takes
/// `&mut self`, so a single instance is never driven from two threads at once.
pub trait Layer<T: TensorElem>: Debug + Send + Sync {
    /// Registry type name.
    fn layer_type(&self) -> &'static str;

    /// Applies `key=value` property strings.
    fn set_property(&mut self, values: &[&str]) -> Result<()>;

    /// Current properties as `(key, value)` pairs.
    fn export_properties(&self) -> Vec<(String, String)>;

    fn finalize(&mut self, ctx: &mut InitContext) -> Result<()>;

    /// Computes the outputs from the inputs currently stored in `ctx`.
    fn forward(&mut self, ctx: &mut RunContext<T>, training: bool) -> Result<()>;

    /// Writes the derivative of the loss with respect to every input.
    fn calc_derivative(&mut self, ctx: &mut RunContext<T>) -> Result<()>;

    /// Writes the gradient of the loss with respect to every weight.
    fn calc_gradient(&mut self, ctx: &mut RunContext<T>) -> Result<()>;

    /// Reallocates batch-dependent buffers for a new batch size.
    fn set_batch(&mut self, ctx: &mut RunContext<T>, batch: usize) -> Result<()>;
}
