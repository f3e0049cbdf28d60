/// Pixel coordinate grids for a cutout inside a larger frame
use ndarray::{Array1, Array2, Zip};

use crate::dual::Scalar;
use crate::error::{PsfError, Result};

/// Position of a cutout inside its parent frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cutout {
    /// (rows, cols)
    pub shape: (usize, usize),
    /// Parent-frame row of the cutout's first row
    pub row_ref: f64,
    /// Parent-frame column of the cutout's first column
    pub col_ref: f64,
}

impl Cutout {
    pub fn new(shape: (usize, usize), row_ref: f64, col_ref: f64) -> Self {
        Self {
            shape,
            row_ref,
            col_ref,
        }
    }

    /// Cutout whose pixel coordinates coincide with its own indices
    pub fn at_origin(shape: (usize, usize)) -> Self {
        Self::new(shape, 0.0, 0.0)
    }

    pub fn pixel_count(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

/// Polar coordinates of every pixel around a reference position.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarCoords {
    pub rho: Array2<f64>,
    pub theta: Array2<f64>,
}

/// Absolute (x, y) coordinates of each pixel of a cutout.
///
/// `x[[i, j]]` is the parent-frame column of pixel (i, j) and `y[[i, j]]` its
/// row. Built once and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateGrid {
    cutout: Cutout,
    x: Array2<f64>,
    y: Array2<f64>,
}

impl CoordinateGrid {
    pub fn new(cutout: Cutout) -> Result<Self> {
        let (rows, cols) = cutout.shape;
        if rows == 0 || cols == 0 {
            return Err(PsfError::EmptyCutout { rows, cols });
        }

        let row_coords = linspace(cutout.row_ref, cutout.row_ref + (rows - 1) as f64, rows);
        let col_coords = linspace(cutout.col_ref, cutout.col_ref + (cols - 1) as f64, cols);

        let y = Array2::from_shape_fn((rows, cols), |(i, _)| row_coords[i]);
        let x = Array2::from_shape_fn((rows, cols), |(_, j)| col_coords[j]);

        Ok(Self { cutout, x, y })
    }

    pub fn cutout(&self) -> Cutout {
        self.cutout
    }

    pub fn shape(&self) -> (usize, usize) {
        self.cutout.shape
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    /// Per-pixel offsets `(grid - x0, grid - y0)` from a (possibly shifted) star position.
    pub fn offsets<S: Scalar>(&self, x0: S, y0: S) -> (Array2<S>, Array2<S>) {
        let dx = self.x.mapv(|v| S::constant(v) - x0);
        let dy = self.y.mapv(|v| S::constant(v) - y0);
        (dx, dy)
    }

    /// Radius and angle of every pixel around `(x0, y0)`.
    pub fn polar(&self, x0: f64, y0: f64) -> PolarCoords {
        let (dx, dy) = self.offsets(x0, y0);
        let rho = Zip::from(&dx)
            .and(&dy)
            .map_collect(|&dx, &dy| (dx * dx + dy * dy).sqrt());
        let theta = Zip::from(&dy).and(&dx).map_collect(|&dy, &dx| dy.atan2(dx));
        PolarCoords { rho, theta }
    }
}

/// `n` evenly spaced samples from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Array1<f64> {
    match n {
        0 => Array1::zeros(0),
        1 => Array1::from_elem(1, start),
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            Array1::from_shape_fn(n, |i| start + step * i as f64)
        }
    }
}
