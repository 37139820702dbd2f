use ndarray::Array1;

use crate::activation::ActFn;
use crate::error::{Result, RnnError};

/// A numeric array augmented with the state a recurrent cell accumulates
/// around it: the cached pre-activation, backpropagated errors, and the two
/// relevance slots used by layer-wise relevance propagation.
///
/// Every slot starts unassigned. Reading a slot before something assigned it
/// is a programming error and fails with `UninitializedAccess`; it is never
/// silently defaulted. The length is fixed at construction and every
/// assignment is checked against it.
#[derive(Debug, Clone, Default)]
pub struct AugmentedArray {
    len: usize,
    values: Option<Array1<f64>>,
    not_activated: Option<Array1<f64>>,
    errors: Option<Array1<f64>>,
    relevance: Option<Array1<f64>>,
    recurrent_relevance: Option<Array1<f64>>,
}

impl AugmentedArray {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_shape(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.len {
            return Err(RnnError::ShapeMismatch {
                what,
                got,
                expected: self.len,
            });
        }
        Ok(())
    }

    pub fn assign_values(&mut self, values: Array1<f64>) -> Result<()> {
        self.check_shape("values", values.len())?;
        self.values = Some(values);
        self.not_activated = None;
        Ok(())
    }

    pub fn values(&self) -> Result<&Array1<f64>> {
        self.values
            .as_ref()
            .ok_or(RnnError::UninitializedAccess { what: "values" })
    }

    pub fn values_mut(&mut self) -> Result<&mut Array1<f64>> {
        self.values
            .as_mut()
            .ok_or(RnnError::UninitializedAccess { what: "values" })
    }

    /// Applies `f` elementwise to the values, caching the pre-activation
    /// snapshot for later derivative and relevance computations.
    pub fn activate(&mut self, f: ActFn) -> Result<()> {
        let raw = self.values()?;
        let activated = f.apply(raw);
        self.not_activated = self.values.take();
        self.values = Some(activated);
        Ok(())
    }

    pub fn not_activated(&self) -> Result<&Array1<f64>> {
        self.not_activated.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "pre-activation values",
        })
    }

    /// The derivative of `f` at this array's input, using the activated-input
    /// form when `f` supports it and the cached pre-activation otherwise.
    pub fn derivative(&self, f: ActFn) -> Result<Array1<f64>> {
        if f.supports_optimized() {
            f.derivative_optimized(self.values()?)
        } else {
            Ok(f.derivative(self.not_activated()?))
        }
    }

    /// Multiplies a dropout mask into the values in place.
    pub fn apply_mask(&mut self, mask: &Array1<f64>) -> Result<()> {
        self.check_shape("dropout mask", mask.len())?;
        *self.values_mut()? *= mask;
        Ok(())
    }

    pub fn assign_errors(&mut self, errors: Array1<f64>) -> Result<()> {
        self.check_shape("errors", errors.len())?;
        self.errors = Some(errors);
        Ok(())
    }

    pub fn errors(&self) -> Result<&Array1<f64>> {
        self.errors
            .as_ref()
            .ok_or(RnnError::UninitializedAccess { what: "errors" })
    }

    pub fn assign_relevance(&mut self, relevance: Array1<f64>) -> Result<()> {
        self.check_shape("relevance", relevance.len())?;
        self.relevance = Some(relevance);
        Ok(())
    }

    pub fn relevance(&self) -> Result<&Array1<f64>> {
        self.relevance
            .as_ref()
            .ok_or(RnnError::UninitializedAccess { what: "relevance" })
    }

    /// Accumulates relevance arriving from a downstream (later) state. A
    /// state may receive several such contributions, so this slot is
    /// additive rather than assign-once.
    pub fn add_recurrent_relevance(&mut self, incoming: &Array1<f64>) -> Result<()> {
        self.check_shape("recurrent relevance", incoming.len())?;
        match &mut self.recurrent_relevance {
            Some(acc) => *acc += incoming,
            None => self.recurrent_relevance = Some(incoming.clone()),
        }
        Ok(())
    }

    pub fn recurrent_relevance(&self) -> Result<&Array1<f64>> {
        self.recurrent_relevance
            .as_ref()
            .ok_or(RnnError::UninitializedAccess {
                what: "recurrent relevance",
            })
    }

    /// Moves the accumulated recurrent relevance out, leaving the slot
    /// unassigned for the next walk.
    pub fn take_recurrent_relevance(&mut self) -> Result<Array1<f64>> {
        self.recurrent_relevance
            .take()
            .ok_or(RnnError::UninitializedAccess {
                what: "recurrent relevance",
            })
    }

    /// Like [`take_recurrent_relevance`](Self::take_recurrent_relevance), but
    /// an empty slot is an ordinary outcome rather than an error.
    pub fn drain_recurrent_relevance(&mut self) -> Option<Array1<f64>> {
        self.recurrent_relevance.take()
    }

    /// Clears every slot so the array can be reused for a new sequence.
    pub fn clear(&mut self) {
        self.values = None;
        self.not_activated = None;
        self.errors = None;
        self.relevance = None;
        self.recurrent_relevance = None;
    }
}
