//! Parameter store and checkpointing.
//!
//! Trainable parameters and auxiliary optimizer state live here, keyed by their fully scoped
//! name (e.g. `jannet0/body0/0_0/attention_0/query`). The store is a cheap handle: clones share
//! the same storage, so the build context, its snapshots and the optimizer all see one set of
//! parameters.
//!
//! Checkpoints use the `safetensors` format. Dimension names are not part of that format, so
//! they travel in the header metadata as a JSON array per tensor.

use crate::autograd::Variable;
use crate::tensor::{Dimension, Shape, Tensor};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info};

const PARAM_PREFIX: &str = "param::";
const AUX_PREFIX: &str = "aux::";

/// How a parameter is initialised on first use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Constant(f32),
    Normal { stddev: f32 },
}

impl Init {
    pub fn sample(&self, shape: &Shape, rng: &mut StdRng) -> Tensor {
        match *self {
            Init::Zeros => Tensor::zeros(shape.clone()),
            Init::Ones => Tensor::ones(shape.clone()),
            Init::Constant(v) => Tensor::full(shape.clone(), v),
            Init::Normal { stddev } => Tensor::from_fn(shape.clone(), |_| {
                let z: f32 = rng.sample(StandardNormal);
                z * stddev
            }),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    params: BTreeMap<String, Variable>,
    aux: BTreeMap<String, Tensor>,
}

/// Shared map of named parameters and auxiliary tensors.
#[derive(Clone, Default)]
pub struct ParameterStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ParameterStore")
            .field("params", &inner.params.len())
            .field("aux", &inner.aux.len())
            .finish()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parameter called `name`, creating it with `init` if it does not exist.
    ///
    /// An existing parameter must have the same dimensions as `shape` (order may differ).
    pub fn get_or_create(
        &self,
        name: &str,
        shape: &Shape,
        init: Init,
        rng: &mut StdRng,
    ) -> Result<Variable> {
        if let Some(existing) = self.inner.borrow().params.get(name) {
            if !existing.shape().same_dims(shape) {
                return Err(Error::Config(format!(
                    "parameter `{name}` exists with shape {} but {} was requested",
                    existing.shape(),
                    shape
                )));
            }
            return Ok(existing.clone());
        }
        let var = Variable::new(init.sample(shape, rng));
        debug!(name, shape = %shape, "created parameter");
        self.inner
            .borrow_mut()
            .params
            .insert(name.to_string(), var.clone());
        Ok(var)
    }

    pub fn get(&self, name: &str) -> Option<Variable> {
        self.inner.borrow().params.get(name).cloned()
    }

    /// All parameters in name order.
    pub fn parameters(&self) -> Vec<(String, Variable)> {
        self.inner
            .borrow()
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.borrow().params.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of trainable scalars.
    pub fn num_elements(&self) -> usize {
        self.inner
            .borrow()
            .params
            .values()
            .map(|v| v.data.size())
            .sum()
    }

    pub fn zero_grad(&self) {
        for var in self.inner.borrow().params.values() {
            var.zero_grad();
        }
    }

    /// Replaces the value of `name`. The new value starts a fresh gradient slot.
    pub fn set_value(&self, name: &str, value: Tensor) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .params
            .get_mut(name)
            .ok_or_else(|| Error::Config(format!("unknown parameter `{name}`")))?;
        if !slot.shape().same_dims(value.shape()) {
            return Err(Error::Config(format!(
                "new value for `{name}` has shape {} but the parameter has {}",
                value.shape(),
                slot.shape()
            )));
        }
        *slot = Variable::new(value);
        Ok(())
    }

    pub fn aux(&self, name: &str) -> Option<Tensor> {
        self.inner.borrow().aux.get(name).cloned()
    }

    /// Auxiliary tensor `name`, or zeros of `shape` if it was never written.
    pub fn aux_or_zeros(&self, name: &str, shape: &Shape) -> Tensor {
        self.aux(name)
            .unwrap_or_else(|| Tensor::zeros(shape.clone()))
    }

    pub fn set_aux(&self, name: &str, value: Tensor) {
        self.inner.borrow_mut().aux.insert(name.to_string(), value);
    }

    pub fn aux_names(&self) -> Vec<String> {
        self.inner.borrow().aux.keys().cloned().collect()
    }

    /// Writes every parameter and auxiliary tensor to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let inner = self.inner.borrow();
        let mut entries: Vec<(String, &Tensor)> = inner
            .params
            .iter()
            .map(|(k, v)| (format!("{PARAM_PREFIX}{k}"), &v.data))
            .collect();
        entries.extend(
            inner
                .aux
                .iter()
                .map(|(k, v)| (format!("{AUX_PREFIX}{k}"), v)),
        );

        // Views borrow the byte buffers, which must outlive serialisation.
        let buffers: Vec<Vec<u8>> = entries
            .iter()
            .map(|(_, t)| t.data().iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();

        let mut views = HashMap::new();
        let mut metadata = HashMap::new();
        for ((name, tensor), bytes) in entries.iter().zip(&buffers) {
            let view = TensorView::new(Dtype::F32, tensor.shape().sizes(), bytes)?;
            views.insert(name.clone(), view);
            metadata.insert(name.clone(), serde_json::to_string(&tensor.shape().names())?);
        }

        safetensors::serialize_to_file(&views, Some(metadata), path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            tensors = views.len(),
            "saved parameter checkpoint"
        );
        Ok(())
    }

    /// Reads a checkpoint written by [`ParameterStore::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let names: HashMap<String, String> = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(&bytes)?;

        let store = ParameterStore::new();
        {
            let mut inner = store.inner.borrow_mut();
            for (key, view) in tensors.tensors() {
                if view.dtype() != Dtype::F32 {
                    return Err(Error::Checkpoint(format!(
                        "tensor `{key}` has dtype {:?}, expected F32",
                        view.dtype()
                    )));
                }
                let dim_names: Vec<String> = match names.get(&key) {
                    Some(json) => serde_json::from_str(json)?,
                    None => {
                        return Err(Error::Checkpoint(format!(
                            "tensor `{key}` has no dimension names"
                        )))
                    }
                };
                if dim_names.len() != view.shape().len() {
                    return Err(Error::Checkpoint(format!(
                        "tensor `{key}` has {} dimension names for rank {}",
                        dim_names.len(),
                        view.shape().len()
                    )));
                }
                let shape = Shape::new(
                    dim_names
                        .into_iter()
                        .zip(view.shape())
                        .map(|(n, s)| Dimension::new(n, *s))
                        .collect(),
                )?;
                let data: Vec<f32> = view
                    .data()
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                let tensor = Tensor::new(data, shape)?;

                if let Some(name) = key.strip_prefix(PARAM_PREFIX) {
                    inner.params.insert(name.to_string(), Variable::new(tensor));
                } else if let Some(name) = key.strip_prefix(AUX_PREFIX) {
                    inner.aux.insert(name.to_string(), tensor);
                } else {
                    return Err(Error::Checkpoint(format!("unexpected tensor `{key}`")));
                }
            }
        }
        info!(
            path = %path.as_ref().display(),
            params = store.len(),
            "loaded parameter checkpoint"
        );
        Ok(store)
    }
}
