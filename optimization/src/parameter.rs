use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::error::{Error, Result};

#[derive(Debug)]
struct ParamData {
    value: Box<[f32]>,
    grad: Option<Box<[f32]>>,
}

/// A shared handle to a trainable buffer and its gradient.
///
/// Cloning a `Parameter` is cheap and yields another handle to the same storage, so the model
/// (through a closure) and the optimizer can both reach it during a step.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<RwLock<ParamData>>,
}

impl Parameter {
    /// Creates a new `Parameter` with no gradient.
    ///
    /// # Arguments
    /// * `value` - The initial values of the parameter.
    ///
    /// # Returns
    /// A new `Parameter` instance.
    pub fn new(value: Vec<f32>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ParamData {
                value: value.into_boxed_slice(),
                grad: None,
            })),
        }
    }

    /// The amount of scalars held by this parameter.
    pub fn len(&self) -> usize {
        self.inner.read().value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the current values.
    pub fn value(&self) -> Vec<f32> {
        self.inner.read().value.to_vec()
    }

    /// Returns a copy of the current gradient, if one was accumulated.
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.inner.read().grad.as_ref().map(|g| g.to_vec())
    }

    pub fn has_grad(&self) -> bool {
        self.inner.read().grad.is_some()
    }

    /// Sums `grad` into this parameter's gradient buffer, allocating it on first use.
    ///
    /// # Arguments
    /// * `grad` - The gradient contribution of one backward pass.
    ///
    /// # Errors
    /// Returns `Error::SizeMismatch` if `grad` and the parameter differ in length.
    pub fn accumulate_grad(&self, grad: &[f32]) -> Result<()> {
        let mut data = self.inner.write();
        let expected = data.value.len();

        if grad.len() != expected {
            return Err(Error::SizeMismatch {
                what: "grad",
                got: grad.len(),
                expected,
            });
        }

        match data.grad.as_mut() {
            Some(acc) => acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g),
            None => data.grad = Some(grad.to_vec().into_boxed_slice()),
        }

        Ok(())
    }

    /// Applies `f` to the gradient buffer in place. Does nothing without a gradient.
    pub fn map_grad<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut [f32]) -> Result<()>,
    {
        match self.inner.write().grad.as_mut() {
            Some(grad) => f(grad),
            None => Ok(()),
        }
    }

    /// Resets the gradient to zeros, keeping the buffer allocated.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.inner.write().grad.as_mut() {
            grad.fill(0.);
        }
    }

    /// Runs an update rule over `(value, grad)`.
    ///
    /// # Returns
    /// `false` without calling `f` when the parameter has no gradient.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut [f32], &[f32]),
    {
        let mut data = self.inner.write();
        let ParamData { value, grad } = &mut *data;

        match grad {
            Some(grad) => {
                f(value, grad);
                true
            }
            None => false,
        }
    }

    /// Returns true if both handles point to the same storage.
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.read();
        f.debug_struct("Parameter")
            .field("len", &data.value.len())
            .field("has_grad", &data.grad.is_some())
            .finish()
    }
}
