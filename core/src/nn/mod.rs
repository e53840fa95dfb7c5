//! Layers the backbone is assembled from.
//!
//! Every layer is a function of a [`BlockArgs`](crate::scope::BlockArgs): it reads the current
//! tensor, creates its parameters through the build context and returns the transformed tensor.
//! Layers are selected by name from a [`BlockConfig`](crate::config::BlockConfig) with
//! [`block_part_fn`].

pub mod activation;
pub mod attention;
pub mod block;
pub mod embedding;
pub mod feed_forward;
pub mod linear;
pub mod norm;

pub use activation::{activate, Activation};
pub use attention::attention;
pub use block::{block_part_fn, LayerKind};
pub use embedding::embed;
pub use feed_forward::feed_forward;
pub use linear::{linear, linear_from_features, linear_to_features};
pub use norm::{norm, rezero};
