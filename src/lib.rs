pub mod bessel;
pub mod calibration;
pub mod config;
pub mod convolve;
pub mod diagnostics;
pub mod dual;
pub mod error;
pub mod grid;
pub mod loss;
pub mod model;
pub mod prf;
pub mod psf_fitting;
pub mod shapes;
pub mod zernike;

// Re-export commonly used items
pub use config::{FitterSettings, ModelConfig};
pub use error::{PsfError, Result};
pub use grid::{CoordinateGrid, Cutout};
pub use loss::Loss;
pub use model::{ParameterLayout, PsfModel};
pub use prf::{PixelResponse, PrfSource};
pub use psf_fitting::{Bound, PsfFit, PsfFitter};
pub use shapes::{ShapeKind, ShapeSpec};
