use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RnnError};

const LECUN_AMP: f64 = 1.7159;
const LECUN_SCALE: f64 = 0.666;
const GELU_SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044_715;

/// Activation functions applied elementwise by cells.
///
/// Every variant provides `f` and the plain derivative `df` evaluated at the
/// pre-activation input. Most variants additionally provide `df_optimized`,
/// the derivative recomputed from the *activated* value alone, which is the
/// cheap path when only `f(x)` is still at hand. Variants that cannot invert
/// their output (GeLU) report `supports_optimized() == false` and fail with
/// `UnsupportedOperation` when that path is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActFn {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu { slope: f64 },
    /// LeCun's scaled tanh, `1.7159 * tanh(0.666 * x)`.
    LecunTanh,
    /// GeLU in its tanh approximation.
    Gelu,
}

use ActFn::*;

impl ActFn {
    pub fn f(&self, x: f64) -> f64 {
        match self {
            Identity => x,
            Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Tanh => x.tanh(),
            Relu => x.max(0.0),
            LeakyRelu { slope } => {
                if x > 0.0 {
                    x
                } else {
                    slope * x
                }
            }
            LecunTanh => LECUN_AMP * (LECUN_SCALE * x).tanh(),
            Gelu => 0.5 * x * (1.0 + gelu_inner(x).tanh()),
        }
    }

    /// Derivative evaluated at the pre-activation input `x`.
    pub fn df(&self, x: f64) -> f64 {
        match self {
            Identity => 1.0,
            Sigmoid => {
                let s = self.f(x);
                s * (1.0 - s)
            }
            Tanh => 1.0 - x.tanh().powi(2),
            Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            LeakyRelu { slope } => {
                if x > 0.0 {
                    1.0
                } else {
                    *slope
                }
            }
            LecunTanh => {
                let t = (LECUN_SCALE * x).tanh();
                LECUN_AMP * LECUN_SCALE * (1.0 - t * t)
            }
            Gelu => {
                let t = gelu_inner(x).tanh();
                let inner_d = GELU_SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * inner_d
            }
        }
    }

    /// Whether `df_optimized` is defined for this variant.
    pub fn supports_optimized(&self) -> bool {
        !matches!(self, Gelu)
    }

    /// Derivative recomputed from the activated value `fx = f(x)`.
    pub fn df_optimized(&self, fx: f64) -> Result<f64> {
        match self {
            Identity => Ok(1.0),
            Sigmoid => Ok(fx * (1.0 - fx)),
            Tanh => Ok(1.0 - fx * fx),
            Relu => Ok(if fx > 0.0 { 1.0 } else { 0.0 }),
            LeakyRelu { slope } => Ok(if fx > 0.0 { 1.0 } else { *slope }),
            LecunTanh => {
                let t = fx / LECUN_AMP;
                Ok(LECUN_AMP * LECUN_SCALE * (1.0 - t * t))
            }
            Gelu => Err(RnnError::UnsupportedOperation(
                "gelu defines no activated-input derivative",
            )),
        }
    }

    pub fn apply(&self, values: &Array1<f64>) -> Array1<f64> {
        values.mapv(|x| self.f(x))
    }

    /// Elementwise `df` at the given pre-activation values.
    pub fn derivative(&self, not_activated: &Array1<f64>) -> Array1<f64> {
        not_activated.mapv(|x| self.df(x))
    }

    /// Elementwise `df_optimized` at the given activated values.
    pub fn derivative_optimized(&self, activated: &Array1<f64>) -> Result<Array1<f64>> {
        let values: Vec<f64> = activated
            .iter()
            .map(|&fx| self.df_optimized(fx))
            .collect::<Result<_>>()?;
        Ok(Array1::from(values))
    }
}

fn gelu_inner(x: f64) -> f64 {
    GELU_SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)
}
