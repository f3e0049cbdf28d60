/// Flux mixture of one or more stars over a shared background
/// `PsfModel` owns the cutout grid, the star list and the shape model, and
/// exposes the flat-vector contract an optimizer drives: `predict`, `bounds`
/// and `default_parameters`.
use std::sync::Arc;

use ndarray::Array2;

use crate::config::ModelConfig;
use crate::diagnostics::{tracing_sink, DiagnosticSink};
use crate::dual::Scalar;
use crate::error::{PsfError, Result};
use crate::grid::{CoordinateGrid, Cutout};
use crate::loss::Loss;
use crate::prf::{PixelResponse, PrfSource};
use crate::psf_fitting::Bound;
use crate::shapes::{PsfShape, Shape, ShapeContext, ShapeSpec};

/// Positions of the named blocks inside a flat parameter vector:
/// `[flux_1 .. flux_N, x_shift, y_shift, background, optical...]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    stars: usize,
    optical: usize,
}

/// Borrowed, named view of a parameter vector
#[derive(Debug, Clone, Copy)]
pub struct ParameterView<'p, S> {
    pub fluxes: &'p [S],
    pub x_shift: S,
    pub y_shift: S,
    pub background: S,
    pub optical: &'p [S],
}

impl ParameterLayout {
    pub fn new(stars: usize, optical: usize) -> Self {
        Self { stars, optical }
    }

    pub fn star_count(&self) -> usize {
        self.stars
    }

    pub fn optical_count(&self) -> usize {
        self.optical
    }

    pub fn len(&self) -> usize {
        self.stars + 3 + self.optical
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x_shift_index(&self) -> usize {
        self.stars
    }

    pub fn y_shift_index(&self) -> usize {
        self.stars + 1
    }

    pub fn background_index(&self) -> usize {
        self.stars + 2
    }

    pub fn split<'p, S: Copy>(&self, params: &'p [S]) -> Result<ParameterView<'p, S>> {
        if params.len() != self.len() {
            return Err(PsfError::ParameterCount {
                expected: self.len(),
                found: params.len(),
            });
        }
        Ok(ParameterView {
            fluxes: &params[..self.stars],
            x_shift: params[self.x_shift_index()],
            y_shift: params[self.y_shift_index()],
            background: params[self.background_index()],
            optical: &params[self.stars + 3..],
        })
    }
}

/// Predicted cutout for a set of stars sharing one shape, shift and background.
///
/// Immutable after construction; the grid and any Zernike cache are only read.
#[derive(Debug, Clone)]
pub struct PsfModel {
    grid: CoordinateGrid,
    xc: Vec<f64>,
    yc: Vec<f64>,
    background: f64,
    loss: Loss,
    prf: PixelResponse,
    shape: Shape,
    shift_limit: f64,
}

pub struct PsfModelBuilder {
    cutout: Cutout,
    xc: Vec<f64>,
    yc: Vec<f64>,
    background: f64,
    loss: Loss,
    spec: ShapeSpec,
    config: ModelConfig,
    sink: Arc<dyn DiagnosticSink>,
}

impl PsfModelBuilder {
    /// Star reference coordinates, in the same frame as the cutout
    pub fn stars(mut self, xc: &[f64], yc: &[f64]) -> Self {
        self.xc = xc.to_vec();
        self.yc = yc.to_vec();
        self
    }

    /// Initial background estimate
    pub fn background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn shape(mut self, spec: ShapeSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self, source: &impl PrfSource) -> Result<PsfModel> {
        if self.xc.len() != self.yc.len() {
            return Err(PsfError::MismatchedStarCoordinates {
                x: self.xc.len(),
                y: self.yc.len(),
            });
        }

        let grid = CoordinateGrid::new(self.cutout)?;
        let prf = source.pixel_response()?;
        let ctx = ShapeContext {
            grid: &grid,
            xc: &self.xc,
            yc: &self.yc,
            prf: &prf,
            config: &self.config,
            sink: self.sink.as_ref(),
        };
        let shape = Shape::build(&self.spec, &ctx)?;

        tracing::debug!(
            stars = self.xc.len(),
            rows = self.cutout.shape.0,
            cols = self.cutout.shape.1,
            shape = %shape.kind(),
            convolved = shape.is_convolved(),
            "Built PSF model"
        );

        Ok(PsfModel {
            grid,
            xc: self.xc,
            yc: self.yc,
            background: self.background,
            loss: self.loss,
            prf,
            shape,
            shift_limit: self.config.shift_limit,
        })
    }
}

impl PsfModel {
    /// Start building a model over `cutout`; defaults to a Gaussian shape,
    /// Gaussian loss, no stars and zero background.
    pub fn builder(cutout: Cutout) -> PsfModelBuilder {
        PsfModelBuilder {
            cutout,
            xc: Vec::new(),
            yc: Vec::new(),
            background: 0.0,
            loss: Loss::Gaussian,
            spec: ShapeSpec::Gaussian,
            config: ModelConfig::default(),
            sink: tracing_sink(),
        }
    }

    pub fn grid(&self) -> &CoordinateGrid {
        &self.grid
    }

    /// Cutout shape `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape()
    }

    pub fn psf(&self) -> &Shape {
        &self.shape
    }

    pub fn star_count(&self) -> usize {
        self.xc.len()
    }

    pub fn star_positions(&self) -> (&[f64], &[f64]) {
        (&self.xc, &self.yc)
    }

    pub fn background_estimate(&self) -> f64 {
        self.background
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    pub fn pixel_response(&self) -> &PixelResponse {
        &self.prf
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(
            self.star_count(),
            self.shape.default_optical_parameters().len(),
        )
    }

    /// One star's contribution: its density, optionally scaled to unit sum,
    /// times `flux`.
    pub fn evaluate<S: Scalar>(
        &self,
        flux: S,
        x_shift: S,
        y_shift: S,
        params: &[S],
        star: usize,
        normalize: bool,
    ) -> Array2<S> {
        let x0 = S::constant(self.xc[star]) + x_shift;
        let y0 = S::constant(self.yc[star]) + y_shift;
        let (dx, dy) = self.grid.offsets(x0, y0);

        let psf = self.shape.density(&dx, &dy, params, star);
        if normalize {
            let total = psf.iter().fold(S::zero(), |acc, &v| acc + v);
            psf.mapv(|v| flux * v / total)
        } else {
            psf.mapv(|v| flux * v)
        }
    }

    /// Sum of every star's contribution plus the background
    pub fn mean<S: Scalar>(
        &self,
        fluxes: &[S],
        x_shift: S,
        y_shift: S,
        background: S,
        params: &[S],
        normalize: bool,
    ) -> Array2<S> {
        debug_assert_eq!(fluxes.len(), self.star_count(), "one flux per star");
        let mut image = Array2::from_elem(self.shape(), background);
        for star in 0..self.star_count() {
            image += &self.evaluate(fluxes[star], x_shift, y_shift, params, star, normalize);
        }
        image
    }

    /// Normalised prediction from a flat parameter vector
    pub fn predict<S: Scalar>(&self, params: &[S]) -> Result<Array2<S>> {
        let view = self.layout().split(params)?;
        Ok(self.mean(
            view.fluxes,
            view.x_shift,
            view.y_shift,
            view.background,
            view.optical,
            true,
        ))
    }

    /// Peak-flux start for every star, zero shift, the background estimate
    /// and the shape's default optical parameters
    pub fn default_parameters(&self, observed: &Array2<f64>) -> Vec<f64> {
        let peak = observed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let peak = if peak.is_finite() { peak } else { 0.0 };

        let mut params = vec![peak; self.star_count()];
        params.extend([0.0, 0.0, self.background]);
        params.extend(self.shape.default_optical_parameters());
        params
    }

    pub fn bounds(&self) -> Vec<Bound> {
        let mut bounds = vec![Bound::non_negative(); self.star_count()];
        bounds.push(Bound::symmetric(self.shift_limit));
        bounds.push(Bound::symmetric(self.shift_limit));
        bounds.push(Bound::non_negative());
        bounds.extend(self.shape.optical_bounds());
        bounds
    }
}
