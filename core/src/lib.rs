//! # vidtext
//!
//! `vidtext` assembles and trains a multi-modal (video + language) transformer on a small CPU
//! tensor library with **named dimensions**.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: `Dimension`, `Shape` and `Tensor`, with broadcasting and einsum by dimension name.
//! - [`autograd`]: reverse-mode differentiation, recompute-on-backward and reversible couplings.
//! - [`scope`]: unique scoped names and the build context every layer receives.
//! - [`store`]: trainable parameters and optimizer state, checkpointed with safetensors.
//! - [`nn`]: layers and the block interpreter.
//! - [`model`]: input encoder, backbone, output decoder and losses.
//! - [`optim`]: the gradient-transform pipeline.
//! - [`train`]: one training step end to end.
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use vidtext::config::{ModelParameter, COLOR_CHANNELS};
//! use vidtext::model::{build, BuildInputs};
//! use vidtext::scope::BuildContext;
//! use vidtext::store::ParameterStore;
//! use vidtext::tensor::{Dimension, Shape, Tensor};
//!
//! let params = ModelParameter { use_language: false, ..Default::default() };
//! let shape = Shape::new(vec![
//!     Dimension::new("batch", 1),
//!     Dimension::new("sequence", 5),
//!     Dimension::new("height", 2),
//!     Dimension::new(COLOR_CHANNELS, 3),
//! ])?;
//! let inputs = BuildInputs { vid: Some(Tensor::zeros(shape)), ..Default::default() };
//!
//! let mut ctx = BuildContext::new(Rc::new(params), ParameterStore::new());
//! let out = build(&mut ctx, &inputs)?;
//! assert!(out.token_loss.is_none());
//! out.total_loss.backward()?;
//! # Ok::<(), vidtext::Error>(())
//! ```

pub mod autograd;
pub mod config;
pub mod error;
pub mod model;
pub mod nn;
pub mod optim;
pub mod scope;
pub mod store;
pub mod tensor;
pub mod train;

pub use autograd::Variable;
pub use error::{Error, Result};
pub use tensor::{DType, Dimension, Shape, Tensor, TensorError};
