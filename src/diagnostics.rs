/// Advisory messages raised while building models
/// Diagnostics go to an injectable sink instead of straight to stderr, so a
/// caller (or a test) decides where they end up.
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::calibration::CoefficientSource;
use crate::shapes::ShapeKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The model has not been validated against real data
    ExperimentalModel { model: ShapeKind },
    /// Where the Zernike residual coefficients came from
    ZernikeCoefficients {
        source: CoefficientSource,
        modes: usize,
    },
    /// Some Zernike modes fell below the cutoff and are excluded
    ModesMasked { masked: usize, total: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ExperimentalModel { model } => write!(
                f,
                "{} model is still being tested and may yield incorrect results",
                model
            ),
            Diagnostic::ZernikeCoefficients { source, modes } => {
                write!(f, "using {} Zernike coefficients for {} modes", source, modes)
            }
            Diagnostic::ModesMasked { masked, total } => {
                write!(f, "{} of {} Zernike modes masked out", masked, total)
            }
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::ExperimentalModel { .. } => tracing::warn!("{}", diagnostic),
            Diagnostic::ZernikeCoefficients { .. } | Diagnostic::ModesMasked { .. } => {
                tracing::info!("{}", diagnostic)
            }
        }
    }
}

/// Keeps every diagnostic in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(diagnostic),
            Err(poisoned) => poisoned.into_inner().push(diagnostic),
        }
    }
}

/// Default sink for callers that don't care
pub fn tracing_sink() -> Arc<dyn DiagnosticSink> {
    Arc::new(TracingSink)
}
