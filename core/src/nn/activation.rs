//! Activation Functions.
//!
//! Activation functions introduce **non-linearity** between projections. Without them a stack of
//! linear layers collapses into a single linear map.
//!
//! - **GELU**: Gaussian Error Linear Unit, the default. Smooth, used in **GPT-2** and **BERT**.
//! - **ReLU**: $f(x) = \max(0, x)$.
//! - **Sigmoid** / **Tanh**: bounded squashing functions.
//!
//! A layer string selects one by suffix, e.g. `feed_forward-relu` or `activation-tanh`.

use crate::autograd::Variable;
use crate::scope::BlockArgs;
use crate::{Error, Result};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Gelu,
    Relu,
    Sigmoid,
    Tanh,
    Identity,
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "identity" | "linear" => Ok(Activation::Identity),
            other => Err(Error::Config(format!("unknown activation '{other}'"))),
        }
    }
}

impl Activation {
    /// The first extra naming an activation, or GELU.
    pub fn from_extras(extras: &[String]) -> Self {
        extras
            .iter()
            .find_map(|e| e.parse().ok())
            .unwrap_or_default()
    }

    pub fn apply(self, x: &Variable) -> Variable {
        match self {
            Activation::Gelu => x.gelu(),
            Activation::Relu => x.relu(),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Tanh => x.tanh(),
            Activation::Identity => x.clone(),
        }
    }
}

/// Applies the activation selected by the layer's extras.
pub fn activate(args: &mut BlockArgs<'_>) -> Result<Variable> {
    Ok(Activation::from_extras(&args.extras).apply(&args.tensor))
}
