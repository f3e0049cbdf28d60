use thiserror::Error;

/// Construction and contract failures.
///
/// Numerical trouble (singular precision matrices, overflowing Bessel terms,
/// zero-sum densities) is never reported here; it shows up as `inf`/`nan` in
/// the predicted image and is left to the loss and the fitter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PsfError {
    #[error("star coordinate lists differ in length: {x} x values, {y} y values")]
    MismatchedStarCoordinates { x: usize, y: usize },

    #[error("cutout shape {rows}x{cols} has no pixels")]
    EmptyCutout { rows: usize, cols: usize },

    #[error("invalid pixel-response image: {0}")]
    InvalidPixelResponse(String),

    #[error("unsupported shape model: {0}")]
    UnsupportedShape(String),

    #[error("unknown loss function: {0}")]
    UnknownLoss(String),

    #[error("expected {expected} parameters, got {found}")]
    ParameterCount { expected: usize, found: usize },

    #[error("expected {expected} bounds, got {found}")]
    BoundsCount { expected: usize, found: usize },

    #[error("not enough data points for fitting: {points} points for {parameters} free parameters")]
    InsufficientData { points: usize, parameters: usize },

    #[error("observed image shape {found:?} does not match cutout shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("reference Zernike coefficients cover {available} modes, basis has {required}")]
    ReferenceCoefficients { available: usize, required: usize },
}

pub type Result<T> = std::result::Result<T, PsfError>;
