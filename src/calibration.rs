/// One-time calibration of the Zernike residual coefficients
/// A Gaussian envelope times a sum of angular Zernike modes is fitted to the
/// reference pixel-response image on a normalised polar grid. Only the mode
/// coefficients are carried into the residual model.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FitterSettings;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::dual::Scalar;
use crate::error::{PsfError, Result};
use crate::grid::linspace;
use crate::prf::PixelResponse;
use crate::psf_fitting::{Bound, LeastSquaresProblem, LevenbergMarquardt, Termination};
use crate::zernike::ZernikeBasis;

/// Stored coefficients for the order-4 (15 mode) basis
pub const REFERENCE_COEFFICIENTS: [f64; 15] = [
    0.2567228,
    0.45743718,
    -0.28847825,
    0.2567228,
    -0.0757324,
    0.11844995,
    -0.28847825,
    0.45743718,
    -0.04414153,
    -0.04167375,
    0.2567228,
    0.11844995,
    -0.0757324,
    0.02526562,
    0.07075336,
];

/// Default residual envelope (a, c)
pub const ZERNIKE_ENVELOPE: [f64; 2] = [0.53327668, 0.53815343];

/// Number of scalar envelope parameters ahead of the coefficients
const ENVELOPE_PARAMS: usize = 5;

/// Where the residual model's coefficients come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoefficientSource {
    /// `REFERENCE_COEFFICIENTS`, no solver run
    Reference,
    /// Least-squares fit against the supplied pixel-response image
    Fitted,
}

impl fmt::Display for CoefficientSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoefficientSource::Reference => write!(f, "reference"),
            CoefficientSource::Fitted => write!(f, "fitted"),
        }
    }
}

/// Fitted template parameters
#[derive(Debug, Clone)]
pub struct Calibration {
    pub amplitude: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub offset: f64,
    pub coefficients: Vec<f64>,
    pub initial_cost: f64,
    pub cost: f64,
    pub iterations: usize,
    pub termination: Termination,
}

/// Template value at one normalised grid point.
///
/// `params` is `[amplitude, x0, y0, width, offset, coeff_0, ...]`:
/// `offset + A * exp(-width * r^2) * sum_k coeff_k * angular_k(theta)`.
pub fn template<S: Scalar>(basis: &ZernikeBasis, x: f64, y: f64, params: &[S]) -> S {
    let dx = S::constant(x) - params[1];
    let dy = S::constant(y) - params[2];
    let r2 = dx * dx + dy * dy;
    let theta = dy.polar_angle(dx);

    let mut modes = S::zero();
    for (k, &coeff) in params[ENVELOPE_PARAMS..].iter().enumerate() {
        modes += coeff * basis.angular(k, theta);
    }

    params[4] + params[0] * (-(params[3] * r2)).exp() * modes
}

struct TemplateProblem<'a> {
    basis: &'a ZernikeBasis,
    xs: Vec<f64>,
    ys: Vec<f64>,
    target: Vec<f64>,
}

impl<'a> TemplateProblem<'a> {
    fn new(basis: &'a ZernikeBasis, prf: &PixelResponse) -> Self {
        let (rows, cols) = prf.shape();
        let row_axis = linspace(-1.0, 1.0, rows);
        let col_axis = linspace(-1.0, 1.0, cols);

        let mut xs = Vec::with_capacity(rows * cols);
        let mut ys = Vec::with_capacity(rows * cols);
        let mut target = Vec::with_capacity(rows * cols);
        for ((i, j), &v) in prf.image().indexed_iter() {
            xs.push(col_axis[j]);
            ys.push(row_axis[i]);
            target.push(v);
        }

        Self {
            basis,
            xs,
            ys,
            target,
        }
    }
}

impl LeastSquaresProblem for TemplateProblem<'_> {
    fn parameter_count(&self) -> usize {
        ENVELOPE_PARAMS + self.basis.mode_count()
    }

    fn residual_count(&self) -> usize {
        self.target.len()
    }

    fn residuals<S: Scalar>(&self, params: &[S]) -> Vec<S> {
        self.xs
            .iter()
            .zip(&self.ys)
            .zip(&self.target)
            .map(|((&x, &y), &t)| template(self.basis, x, y, params) - S::constant(t))
            .collect()
    }
}

/// Fit the template to `prf`, starting from `[1, 0, 0, 1e-3, 0, 0...]` with
/// every parameter unbounded.
pub fn calibrate(
    basis: &ZernikeBasis,
    prf: &PixelResponse,
    settings: &FitterSettings,
) -> Result<Calibration> {
    let problem = TemplateProblem::new(basis, prf);
    let mut initial = vec![1.0, 0.0, 0.0, 1e-3, 0.0];
    initial.resize(problem.parameter_count(), 0.0);
    let bounds = vec![Bound::unbounded(); initial.len()];

    tracing::info!(
        modes = basis.mode_count(),
        rows = prf.shape().0,
        cols = prf.shape().1,
        "Calibrating Zernike coefficients"
    );

    let outcome = LevenbergMarquardt::new(settings).fit(&problem, &initial, &bounds)?;

    tracing::info!(
        cost = outcome.cost,
        iterations = outcome.iterations,
        termination = ?outcome.termination,
        "Calibration finished"
    );

    let p = &outcome.params;
    Ok(Calibration {
        amplitude: p[0],
        center_x: p[1],
        center_y: p[2],
        width: p[3],
        offset: p[4],
        coefficients: p[ENVELOPE_PARAMS..].to_vec(),
        initial_cost: outcome.initial_cost,
        cost: outcome.cost,
        iterations: outcome.iterations,
        termination: outcome.termination,
    })
}

/// Coefficients for `basis` from the configured source
pub fn resolve_coefficients(
    source: CoefficientSource,
    basis: &ZernikeBasis,
    prf: &PixelResponse,
    settings: &FitterSettings,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<f64>> {
    let coefficients = match source {
        CoefficientSource::Reference => {
            if basis.mode_count() != REFERENCE_COEFFICIENTS.len() {
                return Err(PsfError::ReferenceCoefficients {
                    available: REFERENCE_COEFFICIENTS.len(),
                    required: basis.mode_count(),
                });
            }
            REFERENCE_COEFFICIENTS.to_vec()
        }
        CoefficientSource::Fitted => calibrate(basis, prf, settings)?.coefficients,
    };

    sink.emit(Diagnostic::ZernikeCoefficients {
        source,
        modes: coefficients.len(),
    });
    Ok(coefficients)
}
