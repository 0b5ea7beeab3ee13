use crate::tensor::TensorError;
use thiserror::Error;

/// Error type for layer setup, property parsing and the resource registry.
#[derive(Error, Debug)]
pub enum LayerError {
    /// The layer was wired to the wrong number of inputs.
    #[error("{layer} expects {expected} inputs, got {got}")]
    InvalidInputCount {
        layer: &'static str,
        expected: usize,
        got: usize,
    },
    /// A required property was never set.
    #[error("{layer} requires property `{property}`")]
    MissingProperty {
        layer: &'static str,
        property: &'static str,
    },
    /// A property value could not be parsed or is out of range.
    #[error("Invalid value `{value}` for property `{property}`")]
    InvalidProperty { property: String, value: String },
    /// A property key is not recognized by the layer.
    #[error("Unknown property `{0}`")]
    UnknownProperty(String),
    /// The layer was used before `finalize`.
    #[error("Layer has not been finalized")]
    NotFinalized,
    /// A backward procedure ran before any forward pass populated the scratch buffers.
    #[error("Backward pass requested before forward")]
    ForwardNotRun,
    /// A registry tensor was requested without a gradient buffer.
    #[error("Tensor `{0}` has no gradient buffer")]
    NoGradient(String),
    /// A handle does not belong to the context it was used with.
    #[error("Invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, LayerError>;
