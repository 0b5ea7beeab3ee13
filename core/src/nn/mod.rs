pub mod activation;
pub mod context;
pub mod error;
pub mod layer;
pub mod mol_attention;

pub use activation::Activation;
pub use context::{InitContext, RunContext};
pub use error::LayerError;
pub use layer::Layer;
pub use mol_attention::{MolAttention, MolAttentionProps, MolSlots, Segment};
