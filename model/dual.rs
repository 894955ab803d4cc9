//! # Forward-Mode Automatic Differentiation
//!
//! The regularizer, the tridiagonal solver, the SFS helpers and the demographic
//! model are written once against the [`Scalar`] trait and instantiated either
//! over plain `f64` (cheap evaluation) or over [`Dual`] (value plus gradient with
//! respect to every optimizable model coordinate).
//!
//! A `Dual` carries its gradient densely. Constants carry an empty gradient so
//! that the large majority of intermediate values (spans, knot positions, solver
//! coefficients) never allocate.

use ndarray::Array1;
use num_traits::{One, Zero};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Arithmetic needed by the model-evaluation code paths.
///
/// Mixed operations with `f64` right-hand sides are part of the contract so that
/// literal coefficients never have to be lifted by hand.
pub trait Scalar:
    Clone
    + fmt::Debug
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Lifts a plain value into the scalar kind with a zero gradient.
    fn constant(value: f64) -> Self;

    /// The primal value.
    fn value(&self) -> f64;

    fn ln(self) -> Self;

    fn exp(self) -> Self;

    fn powi(self, n: i32) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn constant(value: f64) -> Self {
        value
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
}

/// A value together with its gradient with respect to a fixed set of seeds.
///
/// All non-constant duals taking part in one computation must share the same
/// gradient dimension; mixing dimensions is a programming error and panics.
#[derive(Clone, PartialEq)]
pub struct Dual {
    value: f64,
    grad: Array1<f64>,
}

impl Dual {
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            grad: Array1::zeros(0),
        }
    }

    /// A seed variable: unit partial derivative at `index` out of `dim`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= dim`.
    pub fn variable(value: f64, index: usize, dim: usize) -> Self {
        let mut grad = Array1::zeros(dim);
        grad[index] = 1.0;
        Self { value, grad }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Raw gradient storage; empty for constants.
    pub fn grad(&self) -> &Array1<f64> {
        &self.grad
    }

    pub fn is_constant(&self) -> bool {
        self.grad.is_empty()
    }

    /// Gradient expanded to `dim` entries, zeros for constants.
    ///
    /// # Panics
    ///
    /// Panics if a non-constant value carries a gradient of another length.
    pub fn partials(&self, dim: usize) -> Array1<f64> {
        if self.grad.is_empty() {
            Array1::zeros(dim)
        } else {
            assert_eq!(self.grad.len(), dim, "gradient dimension mismatch");
            self.grad.clone()
        }
    }

    fn scaled(self, factor: f64) -> Array1<f64> {
        let mut grad = self.grad;
        grad.mapv_inplace(|g| g * factor);
        grad
    }
}

/// `wa * ga + wb * gb`, treating empty gradients as zero.
fn combine(ga: Array1<f64>, wa: f64, gb: Array1<f64>, wb: f64) -> Array1<f64> {
    match (ga.is_empty(), gb.is_empty()) {
        (true, true) => ga,
        (false, true) => ga.mapv_into(|g| g * wa),
        (true, false) => gb.mapv_into(|g| g * wb),
        (false, false) => {
            let mut out = ga.mapv_into(|g| g * wa);
            out.scaled_add(wb, &gb);
            out
        }
    }
}

impl fmt::Debug for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.grad.is_empty() {
            write!(f, "Dual({})", self.value)
        } else {
            write!(f, "Dual({}, d={:?})", self.value, self.grad.as_slice())
        }
    }
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        Dual {
            value: self.value + rhs.value,
            grad: combine(self.grad, 1.0, rhs.grad, 1.0),
        }
    }
}

impl Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual {
            value: self.value - rhs.value,
            grad: combine(self.grad, 1.0, rhs.grad, -1.0),
        }
    }
}

impl Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        Dual {
            value: self.value * rhs.value,
            grad: combine(self.grad, rhs.value, rhs.grad, self.value),
        }
    }
}

impl Div for Dual {
    type Output = Dual;
    fn div(self, rhs: Dual) -> Dual {
        let inv = 1.0 / rhs.value;
        let value = self.value * inv;
        Dual {
            value,
            grad: combine(self.grad, inv, rhs.grad, -value * inv),
        }
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        let value = -self.value;
        Dual {
            value,
            grad: self.scaled(-1.0),
        }
    }
}

impl Add<f64> for Dual {
    type Output = Dual;
    fn add(self, rhs: f64) -> Dual {
        Dual {
            value: self.value + rhs,
            grad: self.grad,
        }
    }
}

impl Sub<f64> for Dual {
    type Output = Dual;
    fn sub(self, rhs: f64) -> Dual {
        Dual {
            value: self.value - rhs,
            grad: self.grad,
        }
    }
}

impl Mul<f64> for Dual {
    type Output = Dual;
    fn mul(self, rhs: f64) -> Dual {
        let value = self.value * rhs;
        Dual {
            value,
            grad: self.scaled(rhs),
        }
    }
}

impl Div<f64> for Dual {
    type Output = Dual;
    fn div(self, rhs: f64) -> Dual {
        let value = self.value / rhs;
        Dual {
            value,
            grad: self.scaled(1.0 / rhs),
        }
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Dual::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.value == 0.0 && self.grad.iter().all(|g| *g == 0.0)
    }
}

impl One for Dual {
    fn one() -> Self {
        Dual::constant(1.0)
    }
}

impl Scalar for Dual {
    fn constant(value: f64) -> Self {
        Dual::constant(value)
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn ln(self) -> Self {
        let x = self.value;
        Dual {
            value: x.ln(),
            grad: self.scaled(1.0 / x),
        }
    }

    fn exp(self) -> Self {
        let e = self.value.exp();
        Dual {
            value: e,
            grad: self.scaled(e),
        }
    }

    fn powi(self, n: i32) -> Self {
        let x = self.value;
        let derivative = if n == 0 {
            0.0
        } else {
            f64::from(n) * x.powi(n - 1)
        };
        Dual {
            value: x.powi(n),
            grad: self.scaled(derivative),
        }
    }
}
