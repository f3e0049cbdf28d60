/// PSF shape models
/// Every shape maps per-pixel offsets from a star to an unnormalised intensity.
/// The set is closed: `Shape` dispatches by variant and `ShapeKind` names the
/// shapes that can be built directly or wrapped by the pixel-response convolution.
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::calibration::{resolve_coefficients, ZERNIKE_ENVELOPE};
use crate::config::ModelConfig;
use crate::bessel::modified_bessel;
use crate::convolve::{convolve2d, ConvolveMode};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::dual::Scalar;
use crate::error::{PsfError, Result};
use crate::grid::CoordinateGrid;
use crate::prf::PixelResponse;
use crate::psf_fitting::Bound;
use crate::zernike::{BasisCache, ModeMask, ZernikeBasis};

/// Shapes that can be constructed by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Gaussian,
    Moffat,
    Airy,
    Zernike,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 4] = [
        ShapeKind::Gaussian,
        ShapeKind::Moffat,
        ShapeKind::Airy,
        ShapeKind::Zernike,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Gaussian => "gaussian",
            ShapeKind::Moffat => "moffat",
            ShapeKind::Airy => "airy",
            ShapeKind::Zernike => "zernike",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ShapeKind {
    type Err = PsfError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(ShapeKind::Gaussian),
            "moffat" => Ok(ShapeKind::Moffat),
            "airy" => Ok(ShapeKind::Airy),
            "zernike" => Ok(ShapeKind::Zernike),
            _ => Err(PsfError::UnsupportedShape(s.to_string())),
        }
    }
}

/// Which shape a model is built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeSpec {
    Gaussian,
    Moffat,
    Airy,
    Zernike,
    /// Named shape convolved with the reference pixel response
    PrfConvolution { wrapped: String },
}

impl ShapeSpec {
    pub fn convolved(wrapped: impl Into<String>) -> Self {
        ShapeSpec::PrfConvolution {
            wrapped: wrapped.into(),
        }
    }
}

impl From<ShapeKind> for ShapeSpec {
    fn from(kind: ShapeKind) -> Self {
        match kind {
            ShapeKind::Gaussian => ShapeSpec::Gaussian,
            ShapeKind::Moffat => ShapeSpec::Moffat,
            ShapeKind::Airy => ShapeSpec::Airy,
            ShapeKind::Zernike => ShapeSpec::Zernike,
        }
    }
}

/// Everything a shape may need at construction
pub struct ShapeContext<'a> {
    pub grid: &'a CoordinateGrid,
    pub xc: &'a [f64],
    pub yc: &'a [f64],
    pub prf: &'a PixelResponse,
    pub config: &'a ModelConfig,
    pub sink: &'a dyn DiagnosticSink,
}

pub trait PsfShape {
    fn default_optical_parameters(&self) -> Vec<f64>;

    /// One bound per optical parameter, in parameter order
    fn optical_bounds(&self) -> Vec<Bound>;

    /// Unnormalised intensity at offsets `(dx, dy)` from star `star`
    fn density<S: Scalar>(&self, dx: &Array2<S>, dy: &Array2<S>, params: &[S], star: usize)
        -> Array2<S>;
}

/// Quadratic form `a·dx² + 2b·dx·dy + c·dy²`
fn quadratic<S: Scalar>(x: S, y: S, a: S, b: S, c: S) -> S {
    a * x * x + S::constant(2.0) * b * x * y + c * y * y
}

/// Anisotropic Gaussian with precision matrix `[[a, b], [b, c]]`
#[derive(Debug, Clone, Copy, Default)]
pub struct Gaussian;

impl PsfShape for Gaussian {
    fn default_optical_parameters(&self) -> Vec<f64> {
        vec![1.0, 0.0, 1.0]
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        vec![Bound::non_negative(), Bound::symmetric(0.5), Bound::non_negative()]
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        _star: usize,
    ) -> Array2<S> {
        let (a, b, c) = (params[0], params[1], params[2]);
        Zip::from(dx)
            .and(dy)
            .map_collect(|&x, &y| (-quadratic(x, y, a, b, c)).exp())
    }
}

/// Moffat profile `(1 + a·dx² + 2b·dx·dy + c·dy²)^(-β²)`
///
/// The exponent is `β²`, so `β` and `-β` give the same profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct Moffat;

impl PsfShape for Moffat {
    fn default_optical_parameters(&self) -> Vec<f64> {
        vec![1.0, 0.0, 1.0, 1.0]
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        vec![
            Bound::non_negative(),
            Bound::symmetric(0.5),
            Bound::non_negative(),
            Bound::non_negative(),
        ]
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        _star: usize,
    ) -> Array2<S> {
        let (a, b, c) = (params[0], params[1], params[2]);
        let power = params[3] * params[3];
        Zip::from(dx).and(dy).map_collect(|&x, &y| {
            S::one() / (S::one() + quadratic(x, y, a, b, c)).powf(power)
        })
    }
}

/// Airy disk `(2·I₁(arg)/arg)²` with `arg = π·r/Rn`
///
/// Not yet validated against data; announces itself through the diagnostic
/// sink when built. The pixel sitting exactly on the star gives `nan`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Airy;

impl Airy {
    pub fn new(sink: &dyn DiagnosticSink) -> Self {
        sink.emit(Diagnostic::ExperimentalModel {
            model: ShapeKind::Airy,
        });
        Airy
    }
}

impl PsfShape for Airy {
    fn default_optical_parameters(&self) -> Vec<f64> {
        vec![1.0]
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        vec![Bound::non_negative()]
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        _star: usize,
    ) -> Array2<S> {
        let rn = params[0];
        let arg = Zip::from(dx)
            .and(dy)
            .map_collect(|&x, &y| S::constant(PI) * (x * x + y * y).sqrt() / rn);
        let bessel = modified_bessel(&arg, 1.0);
        Zip::from(&bessel).and(&arg).map_collect(|&i1, &a| {
            let ratio = S::constant(2.0) * i1 / a;
            ratio * ratio
        })
    }
}

/// A named shape convolved with the reference pixel response
#[derive(Debug, Clone)]
pub struct PrfConvolution {
    inner: Box<Shape>,
    kernel: Array2<f64>,
}

impl PrfConvolution {
    /// Resolve `wrapped` and build it; unknown names fail here.
    pub fn new(wrapped: &str, ctx: &ShapeContext<'_>) -> Result<Self> {
        let kind: ShapeKind = wrapped.parse()?;
        let inner = Shape::from_kind(kind, ctx)?;
        Ok(Self {
            inner: Box::new(inner),
            kernel: ctx.prf.image().clone(),
        })
    }

    pub fn inner(&self) -> &Shape {
        &self.inner
    }
}

impl PsfShape for PrfConvolution {
    fn default_optical_parameters(&self) -> Vec<f64> {
        self.inner.default_optical_parameters()
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        self.inner.optical_bounds()
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        star: usize,
    ) -> Array2<S> {
        let psf = self.inner.density(dx, dy, params, star);
        convolve2d(&psf.view(), &self.kernel.view(), ConvolveMode::Same)
    }
}

/// Gaussian envelope times the exponentiated sum of calibrated Zernike modes.
///
/// Optical parameters are `[a, c, zpars...]`. The coefficients are pinned by
/// their bounds so only the envelope moves during a fit.
#[derive(Debug, Clone)]
pub struct ZernikeResidual {
    basis: ZernikeBasis,
    coefficients: Vec<f64>,
    mask: ModeMask,
    cache: BasisCache,
}

impl ZernikeResidual {
    pub fn new(ctx: &ShapeContext<'_>) -> Result<Self> {
        let basis = ZernikeBasis::new(ctx.config.zernike_order);
        let coefficients = resolve_coefficients(
            ctx.config.coefficients,
            &basis,
            ctx.prf,
            &ctx.config.calibration_fitter,
            ctx.sink,
        )?;

        let mask = ModeMask::from_coefficients(&coefficients, ctx.config.mode_cutoff);
        if mask.active_count() < mask.len() {
            ctx.sink.emit(Diagnostic::ModesMasked {
                masked: mask.len() - mask.active_count(),
                total: mask.len(),
            });
        }

        let cache = BasisCache::build(&basis, ctx.grid, ctx.xc, ctx.yc, &mask);
        Ok(Self {
            basis,
            coefficients,
            mask,
            cache,
        })
    }

    pub fn basis(&self) -> &ZernikeBasis {
        &self.basis
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn mask(&self) -> &ModeMask {
        &self.mask
    }

    pub fn cache(&self) -> &BasisCache {
        &self.cache
    }
}

impl PsfShape for ZernikeResidual {
    fn default_optical_parameters(&self) -> Vec<f64> {
        let mut params = ZERNIKE_ENVELOPE.to_vec();
        params.extend_from_slice(&self.coefficients);
        params
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        let mut bounds = vec![Bound::non_negative(), Bound::non_negative()];
        bounds.extend(self.coefficients.iter().map(|&z| Bound::fixed(z)));
        bounds
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        star: usize,
    ) -> Array2<S> {
        let (a, c) = (params[0], params[1]);
        let zpars = &params[2..];

        let mut modes = Array2::<S>::zeros(dx.dim());
        for k in 0..self.mask.len() {
            let weight = S::constant(self.mask.weight(k)) * zpars[k];
            modes.zip_mut_with(self.cache.get(star, k), |acc, &z| *acc += weight * S::constant(z));
        }

        Zip::from(&modes)
            .and(dx)
            .and(dy)
            .map_collect(|&m, &x, &y| m.exp() * (-(a * x * x) - c * y * y).exp())
    }
}

type Constructor = fn(&ShapeContext<'_>) -> Result<Shape>;

fn build_gaussian(_ctx: &ShapeContext<'_>) -> Result<Shape> {
    Ok(Shape::Gaussian(Gaussian))
}

fn build_moffat(_ctx: &ShapeContext<'_>) -> Result<Shape> {
    Ok(Shape::Moffat(Moffat))
}

fn build_airy(ctx: &ShapeContext<'_>) -> Result<Shape> {
    Ok(Shape::Airy(Airy::new(ctx.sink)))
}

fn build_zernike(ctx: &ShapeContext<'_>) -> Result<Shape> {
    ZernikeResidual::new(ctx).map(Shape::Zernike)
}

/// Constructors keyed by kind
const REGISTRY: [(ShapeKind, Constructor); 4] = [
    (ShapeKind::Gaussian, build_gaussian),
    (ShapeKind::Moffat, build_moffat),
    (ShapeKind::Airy, build_airy),
    (ShapeKind::Zernike, build_zernike),
];

/// The closed family of shape models
#[derive(Debug, Clone)]
pub enum Shape {
    Gaussian(Gaussian),
    Moffat(Moffat),
    Airy(Airy),
    Convolved(PrfConvolution),
    Zernike(ZernikeResidual),
}

impl Shape {
    pub fn build(spec: &ShapeSpec, ctx: &ShapeContext<'_>) -> Result<Self> {
        match spec {
            ShapeSpec::Gaussian => Self::from_kind(ShapeKind::Gaussian, ctx),
            ShapeSpec::Moffat => Self::from_kind(ShapeKind::Moffat, ctx),
            ShapeSpec::Airy => Self::from_kind(ShapeKind::Airy, ctx),
            ShapeSpec::Zernike => Self::from_kind(ShapeKind::Zernike, ctx),
            ShapeSpec::PrfConvolution { wrapped } => {
                PrfConvolution::new(wrapped, ctx).map(Shape::Convolved)
            }
        }
    }

    pub fn from_kind(kind: ShapeKind, ctx: &ShapeContext<'_>) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, build)| build(ctx))
            .unwrap_or_else(|| Err(PsfError::UnsupportedShape(kind.to_string())))
    }

    /// Kind of the underlying analytic shape (the wrapped one for convolutions)
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Gaussian(_) => ShapeKind::Gaussian,
            Shape::Moffat(_) => ShapeKind::Moffat,
            Shape::Airy(_) => ShapeKind::Airy,
            Shape::Convolved(conv) => conv.inner().kind(),
            Shape::Zernike(_) => ShapeKind::Zernike,
        }
    }

    pub fn is_convolved(&self) -> bool {
        matches!(self, Shape::Convolved(_))
    }
}

impl PsfShape for Shape {
    fn default_optical_parameters(&self) -> Vec<f64> {
        match self {
            Shape::Gaussian(s) => s.default_optical_parameters(),
            Shape::Moffat(s) => s.default_optical_parameters(),
            Shape::Airy(s) => s.default_optical_parameters(),
            Shape::Convolved(s) => s.default_optical_parameters(),
            Shape::Zernike(s) => s.default_optical_parameters(),
        }
    }

    fn optical_bounds(&self) -> Vec<Bound> {
        match self {
            Shape::Gaussian(s) => s.optical_bounds(),
            Shape::Moffat(s) => s.optical_bounds(),
            Shape::Airy(s) => s.optical_bounds(),
            Shape::Convolved(s) => s.optical_bounds(),
            Shape::Zernike(s) => s.optical_bounds(),
        }
    }

    fn density<S: Scalar>(
        &self,
        dx: &Array2<S>,
        dy: &Array2<S>,
        params: &[S],
        star: usize,
    ) -> Array2<S> {
        match self {
            Shape::Gaussian(s) => s.density(dx, dy, params, star),
            Shape::Moffat(s) => s.density(dx, dy, params, star),
            Shape::Airy(s) => s.density(dx, dy, params, star),
            Shape::Convolved(s) => s.density(dx, dy, params, star),
            Shape::Zernike(s) => s.density(dx, dy, params, star),
        }
    }
}
