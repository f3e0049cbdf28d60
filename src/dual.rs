/// Forward-mode automatic differentiation over `hyperdual`
/// Every density, the model mean and the calibration template are written once
/// against `Scalar`. Evaluating them with `f64` gives plain values; evaluating
/// them with `Dual` carries the derivative along one seeded parameter, which is
/// how the fitters build their Jacobians.
use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign};

use crate::bessel::ModifiedBessel;

/// First-order dual number `re + eps·ε`
pub type Dual = hyperdual::Dual<f64>;

/// Real-valued scalar the PSF models can be evaluated over.
pub trait Scalar:
    hyperdual::Float + AddAssign<Self> + MulAssign<Self> + Debug + Send + Sync + 'static
{
    /// Lift a plain value; carries no derivative
    fn constant(value: f64) -> Self;

    /// Primal value with any derivative information dropped
    fn value(self) -> f64;

    /// Modified Bessel function of the first kind at a fixed order
    fn bessel_i(self, order: f64) -> Self;

    /// Four-quadrant angle of `(x, self)`.
    ///
    /// The direction is undefined at the origin; there the angle is 0 and
    /// carries no derivative instead of `nan`.
    fn polar_angle(self, x: Self) -> Self {
        if self.value() == 0.0 && x.value() == 0.0 {
            Self::zero()
        } else {
            self.atan2(x)
        }
    }
}

impl Scalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }

    fn value(self) -> f64 {
        self
    }

    fn bessel_i(self, order: f64) -> Self {
        ModifiedBessel::new(order).forward(self)
    }
}

impl Scalar for Dual {
    fn constant(value: f64) -> Self {
        Dual::from_real(value)
    }

    fn value(self) -> f64 {
        self.real()
    }

    // The Bessel rule registered with the dual numbers: forward value in the
    // real part, backward recurrence applied to the tangent.
    fn bessel_i(self, order: f64) -> Self {
        let primitive = ModifiedBessel::new(order);
        let x = self.real();
        let eps = tangent(&self);
        let value = primitive.forward(x);
        if eps == 0.0 {
            return Dual::from_real(value);
        }
        Dual::new(value, primitive.backward(x, eps))
    }
}

/// Derivative part of a dual number
pub fn tangent(value: &Dual) -> f64 {
    value[1]
}

/// Lift a parameter slice to duals seeded along parameter `index`.
pub fn seed(params: &[f64], index: usize) -> Vec<Dual> {
    params
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            if i == index {
                Dual::new(p, 1.0)
            } else {
                Dual::from_real(p)
            }
        })
        .collect()
}
