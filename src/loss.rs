/// Loss functions comparing a predicted cutout to observed pixels
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::dual::Scalar;
use crate::error::PsfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loss {
    /// Sum of squared residuals
    Gaussian,
    /// Pearson chi-square, using the model as the pixel variance
    Poisson,
}

impl std::str::FromStr for Loss {
    type Err = PsfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" | "normal" | "l2" => Ok(Loss::Gaussian),
            "poisson" => Ok(Loss::Poisson),
            _ => Err(PsfError::UnknownLoss(s.to_string())),
        }
    }
}

impl Loss {
    /// Residuals whose sum of squares is the loss.
    ///
    /// Non-positive predictions under `Poisson` give `nan` residuals, which
    /// the fitter rejects like any other bad proposal.
    pub fn residuals<S: Scalar>(&self, observed: &Array2<f64>, predicted: &Array2<S>) -> Vec<S> {
        observed
            .iter()
            .zip(predicted.iter())
            .map(|(&obs, &pred)| {
                let diff = S::constant(obs) - pred;
                match self {
                    Loss::Gaussian => diff,
                    Loss::Poisson => {
                        if pred.value() > 0.0 {
                            diff / pred.sqrt()
                        } else {
                            S::constant(f64::NAN)
                        }
                    }
                }
            })
            .collect()
    }

    pub fn value(&self, observed: &Array2<f64>, predicted: &Array2<f64>) -> f64 {
        self.residuals(observed, predicted)
            .iter()
            .map(|r| r * r)
            .sum()
    }
}
