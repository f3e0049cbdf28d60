/// Reference pixel-response function (PRF) images
/// The PRF describes how a point source spreads over detector pixels. It is the
/// convolution kernel of the wrapped shape model and the target of the Zernike
/// calibration. Where it comes from (catalogue, survey product) is up to the caller.
use ndarray::Array2;

use crate::error::{PsfError, Result};
use crate::grid::linspace;

#[derive(Debug, Clone, PartialEq)]
pub struct PixelResponse {
    image: Array2<f64>,
}

impl PixelResponse {
    /// Validate and wrap a reference image: non-empty and finite everywhere.
    pub fn new(image: Array2<f64>) -> Result<Self> {
        let (rows, cols) = image.dim();
        if rows == 0 || cols == 0 {
            return Err(PsfError::InvalidPixelResponse(format!(
                "image has shape {}x{}",
                rows, cols
            )));
        }
        if let Some(((r, c), v)) = image.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(PsfError::InvalidPixelResponse(format!(
                "non-finite value {} at ({}, {})",
                v, r, c
            )));
        }
        Ok(Self { image })
    }

    /// Synthetic circular Gaussian PRF sampled on `linspace(-1, 1, size)` axes,
    /// the same normalised coordinates the calibration fit uses.
    pub fn gaussian(size: usize, width: f64) -> Result<Self> {
        let axis = linspace(-1.0, 1.0, size);
        let image = Array2::from_shape_fn((size, size), |(i, j)| {
            let r2 = axis[i] * axis[i] + axis[j] * axis[j];
            (-r2 / (2.0 * width * width)).exp()
        });
        Self::new(image)
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn shape(&self) -> (usize, usize) {
        self.image.dim()
    }
}

/// Anything that can produce a reference pixel-response image for a model.
pub trait PrfSource {
    fn pixel_response(&self) -> Result<PixelResponse>;
}

impl PrfSource for PixelResponse {
    fn pixel_response(&self) -> Result<PixelResponse> {
        Ok(self.clone())
    }
}

impl PrfSource for Array2<f64> {
    fn pixel_response(&self) -> Result<PixelResponse> {
        PixelResponse::new(self.clone())
    }
}
