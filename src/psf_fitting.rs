/// PSF (Point Spread Function) fitting module
/// Bounded Levenberg-Marquardt least squares with Jacobians from forward-mode
/// dual numbers, and the fitter that drives a `PsfModel` against a cutout
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::config::FitterSettings;
use crate::dual::{seed, tangent, Scalar};
use crate::error::{PsfError, Result};
use crate::model::PsfModel;

/// Closed interval a single parameter may take
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// [0, +inf)
    pub fn non_negative() -> Self {
        Self::new(0.0, f64::INFINITY)
    }

    pub fn unbounded() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Pins a parameter to a single value
    pub fn fixed(value: f64) -> Self {
        Self::new(value, value)
    }

    /// [-limit, limit]
    pub fn symmetric(limit: f64) -> Self {
        Self::new(-limit, limit)
    }

    pub fn is_fixed(&self) -> bool {
        self.lower >= self.upper
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }
}

/// A sum-of-squares objective over a flat parameter vector
pub trait LeastSquaresProblem {
    fn parameter_count(&self) -> usize;

    fn residual_count(&self) -> usize;

    /// Residuals at `params`; called with `f64` for values and `Dual` for Jacobian columns
    fn residuals<S: Scalar>(&self, params: &[S]) -> Vec<S>;
}

/// Why the optimizer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Relative cost decrease fell below the tolerance
    Converged,
    /// Damping grew past its limit without finding a better point
    Stalled,
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    pub cost: f64,
    pub initial_cost: f64,
    pub iterations: usize,
    pub termination: Termination,
}

const MAX_LAMBDA: f64 = 1e10;

/// Levenberg-Marquardt optimizer with box constraints
///
/// Proposed steps are clamped into the bounds. Parameters whose bounds collapse
/// to a single value are held fixed and left out of the normal equations.
/// Proposals with a `nan` cost are rejected like any other uphill step.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new(&FitterSettings::default())
    }
}

impl LevenbergMarquardt {
    pub fn new(settings: &FitterSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            tolerance: settings.tolerance,
            lambda: settings.lambda,
            lambda_factor: settings.lambda_factor,
        }
    }

    pub fn fit<P: LeastSquaresProblem>(
        &self,
        problem: &P,
        initial_params: &[f64],
        bounds: &[Bound],
    ) -> Result<FitOutcome> {
        let n_params = problem.parameter_count();
        if initial_params.len() != n_params {
            return Err(PsfError::ParameterCount {
                expected: n_params,
                found: initial_params.len(),
            });
        }
        if bounds.len() != n_params {
            return Err(PsfError::BoundsCount {
                expected: n_params,
                found: bounds.len(),
            });
        }

        let free: Vec<usize> = (0..n_params).filter(|&i| !bounds[i].is_fixed()).collect();
        let n_points = problem.residual_count();
        if n_points < free.len() {
            return Err(PsfError::InsufficientData {
                points: n_points,
                parameters: free.len(),
            });
        }

        let clamped = initial_params
            .iter()
            .zip(bounds)
            .filter(|(&p, b)| !b.contains(p))
            .count();
        if clamped > 0 {
            tracing::debug!(clamped, "initial parameters moved into their bounds");
        }
        let mut params: Vec<f64> = initial_params
            .iter()
            .zip(bounds)
            .map(|(&p, b)| b.clamp(p))
            .collect();
        let mut current_error = cost(&problem.residuals(&params));
        let initial_cost = current_error;
        let mut lambda = self.lambda;
        let mut termination = Termination::MaxIterations;
        let mut iterations = 0;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;
            if free.is_empty() || current_error == 0.0 {
                termination = Termination::Converged;
                break;
            }

            let (residuals, jacobian) = linearize(problem, &params, &free);
            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let neg_jtr = -(&jt * &residuals);

            loop {
                // Add lambda to diagonal (LM modification)
                let mut h = jtj.clone();
                for i in 0..free.len() {
                    h[(i, i)] += lambda;
                }

                let Some(delta) = h.lu().solve(&neg_jtr) else {
                    // Singular matrix, increase lambda
                    lambda *= self.lambda_factor;
                    if lambda > MAX_LAMBDA {
                        termination = Termination::Stalled;
                        break;
                    }
                    continue;
                };

                let mut new_params = params.clone();
                for (col, &idx) in free.iter().enumerate() {
                    new_params[idx] = bounds[idx].clamp(params[idx] + delta[col]);
                }
                let new_error = cost(&problem.residuals(&new_params));

                if new_error < current_error {
                    let improvement = (current_error - new_error) / current_error;
                    tracing::debug!(
                        iteration = iterations,
                        cost = new_error,
                        lambda,
                        "accepted Levenberg-Marquardt step"
                    );
                    params = new_params;
                    current_error = new_error;
                    lambda /= self.lambda_factor;
                    if improvement < self.tolerance {
                        termination = Termination::Converged;
                    }
                    break;
                }

                // Reject update, increase lambda
                lambda *= self.lambda_factor;
                if lambda > MAX_LAMBDA {
                    termination = Termination::Stalled;
                    break;
                }
            }

            if termination != Termination::MaxIterations {
                break;
            }
        }

        Ok(FitOutcome {
            params,
            cost: current_error,
            initial_cost,
            iterations,
            termination,
        })
    }
}

fn cost(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

/// Residuals and the Jacobian columns of the free parameters
fn linearize<P: LeastSquaresProblem>(
    problem: &P,
    params: &[f64],
    free: &[usize],
) -> (DVector<f64>, DMatrix<f64>) {
    let residuals = problem.residuals(params);
    let mut jacobian = DMatrix::<f64>::zeros(residuals.len(), free.len());

    for (col, &idx) in free.iter().enumerate() {
        let column = problem.residuals(&seed(params, idx));
        for (row, r) in column.iter().enumerate() {
            jacobian[(row, col)] = tangent(r);
        }
    }

    (DVector::from_vec(residuals), jacobian)
}

/// Result of fitting a model to one cutout
#[derive(Debug, Clone)]
pub struct PsfFit {
    /// Full fitted parameter vector
    pub parameters: Vec<f64>,
    /// Per-star flux
    pub fluxes: Vec<f64>,
    pub x_shift: f64,
    pub y_shift: f64,
    pub background: f64,
    /// Shape-specific parameters
    pub optical: Vec<f64>,
    /// Final loss value
    pub loss: f64,
    /// R-squared goodness of fit
    pub r_squared: f64,
    /// Root mean square error
    pub rmse: f64,
    pub iterations: usize,
    pub termination: Termination,
}

struct CutoutProblem<'a> {
    model: &'a PsfModel,
    observed: &'a Array2<f64>,
}

impl LeastSquaresProblem for CutoutProblem<'_> {
    fn parameter_count(&self) -> usize {
        self.model.layout().len()
    }

    fn residual_count(&self) -> usize {
        self.observed.len()
    }

    fn residuals<S: Scalar>(&self, params: &[S]) -> Vec<S> {
        match self.model.predict(params) {
            Ok(predicted) => self.model.loss().residuals(self.observed, &predicted),
            Err(_) => vec![S::constant(f64::NAN); self.observed.len()],
        }
    }
}

/// Fits a `PsfModel` to observed cutouts
pub struct PsfFitter<'a> {
    model: &'a PsfModel,
    settings: FitterSettings,
}

impl<'a> PsfFitter<'a> {
    pub fn new(model: &'a PsfModel, settings: FitterSettings) -> Self {
        Self { model, settings }
    }

    /// Fit starting from the model's default parameters
    pub fn fit(&self, observed: &Array2<f64>) -> Result<PsfFit> {
        let initial = self.model.default_parameters(observed);
        self.fit_from(observed, &initial)
    }

    pub fn fit_from(&self, observed: &Array2<f64>, initial_params: &[f64]) -> Result<PsfFit> {
        if observed.dim() != self.model.shape() {
            return Err(PsfError::ShapeMismatch {
                expected: self.model.shape(),
                found: observed.dim(),
            });
        }

        let problem = CutoutProblem {
            model: self.model,
            observed,
        };
        let optimizer = LevenbergMarquardt::new(&self.settings);
        let outcome = optimizer.fit(&problem, initial_params, &self.model.bounds())?;

        let predicted = self.model.predict(&outcome.params)?;
        let loss = self.model.loss().value(observed, &predicted);

        // Calculate goodness of fit
        let mean_value = observed.mean().unwrap_or(0.0);
        let mut sum_squared_residuals = 0.0;
        let mut sum_squared_total = 0.0;
        for (obs, pred) in observed.iter().zip(predicted.iter()) {
            sum_squared_residuals += (obs - pred).powi(2);
            sum_squared_total += (obs - mean_value).powi(2);
        }
        let r_squared = if sum_squared_total > 0.0 {
            1.0 - sum_squared_residuals / sum_squared_total
        } else {
            0.0
        };
        let rmse = (sum_squared_residuals / observed.len() as f64).sqrt();

        tracing::info!(
            iterations = outcome.iterations,
            termination = ?outcome.termination,
            loss,
            r_squared,
            "PSF fit finished"
        );

        let view = self.model.layout().split(&outcome.params)?;
        Ok(PsfFit {
            fluxes: view.fluxes.to_vec(),
            x_shift: view.x_shift,
            y_shift: view.y_shift,
            background: view.background,
            optical: view.optical.to_vec(),
            loss,
            r_squared,
            rmse,
            iterations: outcome.iterations,
            termination: outcome.termination,
            parameters: outcome.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::grid::Cutout;
    use crate::loss::Loss;
    use crate::prf::PixelResponse;
    use crate::shapes::ShapeSpec;
    use rand::prelude::*;

    /// y = a * exp(-b * x) sampled on a fixed grid
    struct ExpDecay {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl LeastSquaresProblem for ExpDecay {
        fn parameter_count(&self) -> usize {
            2
        }

        fn residual_count(&self) -> usize {
            self.xs.len()
        }

        fn residuals<S: Scalar>(&self, params: &[S]) -> Vec<S> {
            self.xs
                .iter()
                .zip(&self.ys)
                .map(|(&x, &y)| S::constant(y) - params[0] * (-(params[1] * S::constant(x))).exp())
                .collect()
        }
    }

    fn exp_decay(a: f64, b: f64) -> ExpDecay {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let ys = xs.iter().map(|x| a * (-b * x).exp()).collect();
        ExpDecay { xs, ys }
    }

    #[test]
    fn test_bound_helpers() {
        let b = Bound::symmetric(2.0);
        assert_eq!(b.clamp(3.0), 2.0);
        assert_eq!(b.clamp(-5.0), -2.0);
        assert!(b.contains(0.5));
        assert!(Bound::fixed(1.5).is_fixed());
        assert!(!Bound::non_negative().is_fixed());
        assert_eq!(Bound::unbounded().clamp(1e300), 1e300);
    }

    #[test]
    fn test_unconstrained_fit_recovers_parameters() {
        let problem = exp_decay(3.0, 0.7);
        let bounds = vec![Bound::unbounded(); 2];
        let outcome = LevenbergMarquardt::default()
            .fit(&problem, &[1.0, 0.2], &bounds)
            .unwrap();

        assert!((outcome.params[0] - 3.0).abs() < 1e-4);
        assert!((outcome.params[1] - 0.7).abs() < 1e-4);
        assert!(outcome.cost < outcome.initial_cost);
    }

    #[test]
    fn test_bounds_are_respected() {
        let problem = exp_decay(3.0, 0.7);
        let bounds = vec![Bound::new(0.0, 2.0), Bound::unbounded()];
        let outcome = LevenbergMarquardt::default()
            .fit(&problem, &[1.0, 0.2], &bounds)
            .unwrap();
        assert!(outcome.params[0] <= 2.0);
    }

    #[test]
    fn test_fixed_parameters_do_not_move() {
        let problem = exp_decay(3.0, 0.7);
        let bounds = vec![Bound::fixed(3.0), Bound::unbounded()];
        let outcome = LevenbergMarquardt::default()
            .fit(&problem, &[3.0, 0.2], &bounds)
            .unwrap();
        assert_eq!(outcome.params[0], 3.0);
        assert!((outcome.params[1] - 0.7).abs() < 1e-4);
    }

    #[test]
    fn test_length_checks() {
        let problem = exp_decay(3.0, 0.7);
        let lm = LevenbergMarquardt::default();
        assert_eq!(
            lm.fit(&problem, &[1.0], &[Bound::unbounded(); 2]).unwrap_err(),
            PsfError::ParameterCount {
                expected: 2,
                found: 1
            }
        );
        assert_eq!(
            lm.fit(&problem, &[1.0, 1.0], &[Bound::unbounded(); 3])
                .unwrap_err(),
            PsfError::BoundsCount {
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn test_insufficient_data() {
        let problem = ExpDecay {
            xs: vec![1.0],
            ys: vec![2.0],
        };
        let err = LevenbergMarquardt::default()
            .fit(&problem, &[1.0, 1.0], &[Bound::unbounded(); 2])
            .unwrap_err();
        assert_eq!(
            err,
            PsfError::InsufficientData {
                points: 1,
                parameters: 2
            }
        );
    }

    fn gaussian_model(xc: &[f64], yc: &[f64], loss: Loss) -> PsfModel {
        let prf = PixelResponse::gaussian(9, 0.4).unwrap();
        PsfModel::builder(Cutout::at_origin((15, 15)))
            .stars(xc, yc)
            .background(10.0)
            .loss(loss)
            .shape(ShapeSpec::Gaussian)
            .sink(CollectingSink::new())
            .build(&prf)
            .unwrap()
    }

    fn noisy(image: &Array2<f64>, sigma: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        image.mapv(|v| v + (rng.gen::<f64>() - 0.5) * 2.0 * sigma)
    }

    #[test]
    fn test_fit_two_star_gaussian_cutout() {
        let model = gaussian_model(&[4.0, 10.0], &[5.0, 9.0], Loss::Gaussian);
        let truth = vec![500.0, 300.0, 0.3, -0.2, 12.0, 0.6, 0.05, 0.4];
        let clean = model.predict(&truth).unwrap();
        let observed = noisy(&clean, 0.5, 7);

        let fit = PsfFitter::new(&model, FitterSettings::default())
            .fit(&observed)
            .unwrap();

        assert!((fit.fluxes[0] - 500.0).abs() / 500.0 < 0.05, "{:?}", fit);
        assert!((fit.fluxes[1] - 300.0).abs() / 300.0 < 0.05, "{:?}", fit);
        assert!((fit.x_shift - 0.3).abs() < 0.1);
        assert!((fit.y_shift + 0.2).abs() < 0.1);
        assert!((fit.background - 12.0).abs() < 0.5);
        assert!(fit.r_squared > 0.95);
        assert_eq!(fit.parameters.len(), truth.len());
    }

    #[test]
    fn test_fit_with_poisson_loss() {
        let model = gaussian_model(&[7.0], &[7.0], Loss::Poisson);
        let truth = vec![800.0, -0.4, 0.25, 5.0, 0.5, 0.0, 0.5];
        let observed = model.predict(&truth).unwrap();

        let fit = PsfFitter::new(&model, FitterSettings::default())
            .fit(&observed)
            .unwrap();

        assert!((fit.fluxes[0] - 800.0).abs() / 800.0 < 0.02, "{:?}", fit);
        assert!((fit.x_shift + 0.4).abs() < 0.05);
        assert!(fit.loss < 1e-3);
    }

    #[test]
    fn test_fit_loss_is_model_loss_at_optimum() {
        let model = gaussian_model(&[7.0], &[7.0], Loss::Poisson);
        let truth = vec![400.0, 0.1, -0.1, 8.0, 0.6, 0.0, 0.6];
        let observed = noisy(&model.predict(&truth).unwrap(), 1.0, 3);

        let fit = PsfFitter::new(&model, FitterSettings::default())
            .fit(&observed)
            .unwrap();
        let predicted = model.predict(&fit.parameters).unwrap();
        assert_eq!(fit.loss, Loss::Poisson.value(&observed, &predicted));
        assert!(fit.loss > 0.0);
    }

    #[test]
    fn test_out_of_bounds_start_is_clamped() {
        let problem = exp_decay(3.0, 0.7);
        let bounds = vec![Bound::new(0.0, 5.0), Bound::new(0.1, 2.0)];
        assert!(!bounds[0].contains(-4.0));
        let outcome = LevenbergMarquardt::default()
            .fit(&problem, &[-4.0, 9.0], &bounds)
            .unwrap();
        assert!(bounds.iter().zip(&outcome.params).all(|(b, &p)| b.contains(p)));
        assert!((outcome.params[0] - 3.0).abs() < 1e-3);
        assert!((outcome.params[1] - 0.7).abs() < 1e-3);
    }

    #[test]
    fn test_fit_rejects_wrong_shape() {
        let model = gaussian_model(&[7.0], &[7.0], Loss::Gaussian);
        let err = PsfFitter::new(&model, FitterSettings::default())
            .fit(&Array2::zeros((3, 3)))
            .unwrap_err();
        assert_eq!(
            err,
            PsfError::ShapeMismatch {
                expected: (15, 15),
                found: (3, 3)
            }
        );
    }
}
