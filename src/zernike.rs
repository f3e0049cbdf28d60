/// Zernike polynomial basis in Noll ordering
/// The residual PSF model only uses the angular factor of each mode, but the
/// full basis (radial polynomials with Noll normalisation) is built here so the
/// same mode indices can be used to reconstruct complete wavefront-style terms.
/// Mode index `k` is zero-based; the Noll index is `j = k + 1`.
use ndarray::Array2;

use crate::dual::Scalar;
use crate::grid::{CoordinateGrid, PolarCoords};

/// Normalisation applied to the radial polynomials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalisation {
    /// Unit-variance over the unit disk
    Noll,
    /// Raw polynomials
    None,
}

/// Orthogonal polar basis up to a maximum radial order.
#[derive(Debug, Clone, PartialEq)]
pub struct ZernikeBasis {
    order: usize,
    normalisation: Normalisation,
    ntab: Vec<u32>,
    mtab: Vec<i32>,
    /// Radial coefficients per mode, highest power of rho first
    rhotab: Vec<Vec<f64>>,
}

impl ZernikeBasis {
    /// Noll-normalised basis with all radial orders `0..=order`
    pub fn new(order: usize) -> Self {
        Self::with_normalisation(order, Normalisation::Noll)
    }

    pub fn with_normalisation(order: usize, normalisation: Normalisation) -> Self {
        let nk = (order + 1) * (order + 2) / 2;
        let mut ntab = Vec::with_capacity(nk);
        let mut mtab = Vec::with_capacity(nk);
        let mut rhotab = Vec::with_capacity(nk);

        for k in 0..nk {
            let (n, m) = noll_to_nm(k + 1);
            let ck = match normalisation {
                Normalisation::Noll => noll_factor(n, m),
                Normalisation::None => 1.0,
            };
            rhotab.push(
                radial_coefficients(n, m.unsigned_abs())
                    .into_iter()
                    .map(|c| c * ck)
                    .collect(),
            );
            ntab.push(n);
            mtab.push(m);
        }

        Self {
            order,
            normalisation,
            ntab,
            mtab,
            rhotab,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn normalisation(&self) -> Normalisation {
        self.normalisation
    }

    /// Number of modes, `(order + 1)(order + 2) / 2`
    pub fn mode_count(&self) -> usize {
        self.ntab.len()
    }

    pub fn radial_order(&self, k: usize) -> u32 {
        self.ntab[k]
    }

    pub fn azimuthal_order(&self, k: usize) -> i32 {
        self.mtab[k]
    }

    /// Normalised radial polynomial of mode `k`, by Horner's rule
    pub fn radial<S: Scalar>(&self, k: usize, rho: S) -> S {
        self.rhotab[k]
            .iter()
            .fold(S::zero(), |acc, &c| acc * rho + S::constant(c))
    }

    /// `cos(mθ)` for `m >= 0`, `sin(-mθ)` otherwise
    pub fn angular<S: Scalar>(&self, k: usize, theta: S) -> S {
        let m = self.mtab[k];
        if m >= 0 {
            (S::constant(m as f64) * theta).cos()
        } else {
            (S::constant(-m as f64) * theta).sin()
        }
    }

    /// Full mode value `R_k(ρ)·A_k(θ)`
    pub fn evaluate<S: Scalar>(&self, k: usize, rho: S, theta: S) -> S {
        self.radial(k, rho) * self.angular(k, theta)
    }

    pub fn angular_image(&self, k: usize, theta: &Array2<f64>) -> Array2<f64> {
        theta.mapv(|t| self.angular(k, t))
    }
}

/// Radial order `n` and signed azimuthal order `m` of Noll index `j >= 1`.
///
/// Even `j` carry cosine terms (`m > 0`), odd `j` sine terms (`m < 0`).
pub fn noll_to_nm(j: usize) -> (u32, i32) {
    assert!(j >= 1, "Noll indices start at 1");
    let mut n = 0usize;
    while (n + 1) * (n + 2) / 2 < j {
        n += 1;
    }
    let p = j - n * (n + 1) / 2;
    let m_abs = if n % 2 == 0 {
        2 * (p / 2)
    } else {
        2 * ((p - 1) / 2) + 1
    };
    let m = if m_abs != 0 && j % 2 == 1 {
        -(m_abs as i32)
    } else {
        m_abs as i32
    };
    (n as u32, m)
}

fn noll_factor(n: u32, m: i32) -> f64 {
    let n = n as f64;
    if m == 0 {
        (n + 1.0).sqrt()
    } else {
        (2.0 * (n + 1.0)).sqrt()
    }
}

/// Coefficients of `R_n^m(ρ)` from `ρ^n` down to `ρ^0`.
fn radial_coefficients(n: u32, m: u32) -> Vec<f64> {
    let mut coeffs = vec![0.0; n as usize + 1];
    for s in 0..=((n - m) / 2) {
        let sign = if s % 2 == 0 { 1.0 } else { -1.0 };
        let value = sign * factorial(n - s)
            / (factorial(s) * factorial((n + m) / 2 - s) * factorial((n - m) / 2 - s));
        // Power n - 2s sits at position 2s from the front
        coeffs[2 * s as usize] = value;
    }
    coeffs
}

fn factorial(n: u32) -> f64 {
    (1..=n).map(|v| v as f64).product()
}

/// Which modes take part in the residual model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeMask {
    active: Vec<bool>,
}

impl ModeMask {
    pub fn all(modes: usize) -> Self {
        Self {
            active: vec![true; modes],
        }
    }

    /// A mode is active iff `|coefficient| > cutoff`
    pub fn from_coefficients(coefficients: &[f64], cutoff: f64) -> Self {
        Self {
            active: coefficients.iter().map(|c| c.abs() > cutoff).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_active(&self, k: usize) -> bool {
        self.active[k]
    }

    /// 1.0 for active modes, 0.0 for masked ones
    pub fn weight(&self, k: usize) -> f64 {
        if self.active[k] {
            1.0
        } else {
            0.0
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }
}

/// Dense star × mode table of angular basis images.
///
/// Masked modes hold an all-zero image so the residual density can sum every
/// mode without branching.
#[derive(Debug, Clone)]
pub struct BasisCache {
    modes: usize,
    images: Vec<Array2<f64>>,
    polar: Vec<PolarCoords>,
}

impl BasisCache {
    pub fn build(
        basis: &ZernikeBasis,
        grid: &CoordinateGrid,
        xc: &[f64],
        yc: &[f64],
        mask: &ModeMask,
    ) -> Self {
        let modes = basis.mode_count();
        let shape = grid.shape();
        let mut images = Vec::with_capacity(xc.len() * modes);
        let mut polar = Vec::with_capacity(xc.len());

        for (&x0, &y0) in xc.iter().zip(yc) {
            let coords = grid.polar(x0, y0);
            for k in 0..modes {
                if mask.is_active(k) {
                    images.push(basis.angular_image(k, &coords.theta));
                } else {
                    images.push(Array2::zeros(shape));
                }
            }
            polar.push(coords);
        }

        Self {
            modes,
            images,
            polar,
        }
    }

    pub fn star_count(&self) -> usize {
        self.polar.len()
    }

    pub fn mode_count(&self) -> usize {
        self.modes
    }

    pub fn get(&self, star: usize, mode: usize) -> &Array2<f64> {
        &self.images[star * self.modes + mode]
    }

    pub fn polar(&self, star: usize) -> &PolarCoords {
        &self.polar[star]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{linspace, Cutout};
    use std::f64::consts::PI;

    #[test]
    fn test_noll_ordering() {
        let expected = [
            (0, 0),
            (1, 1),
            (1, -1),
            (2, 0),
            (2, -2),
            (2, 2),
            (3, -1),
            (3, 1),
            (3, -3),
            (3, 3),
            (4, 0),
            (4, 2),
            (4, -2),
            (4, 4),
            (4, -4),
        ];
        for (k, &nm) in expected.iter().enumerate() {
            assert_eq!(noll_to_nm(k + 1), nm, "Noll index {}", k + 1);
        }
    }

    #[test]
    fn test_mode_count() {
        assert_eq!(ZernikeBasis::new(0).mode_count(), 1);
        assert_eq!(ZernikeBasis::new(2).mode_count(), 6);
        assert_eq!(ZernikeBasis::new(4).mode_count(), 15);
    }

    #[test]
    fn test_radial_polynomials() {
        let basis = ZernikeBasis::with_normalisation(4, Normalisation::None);
        let rho: f64 = 0.6;
        // Defocus R_2^0 = 2ρ² - 1
        assert!((basis.radial(3, rho) - (2.0 * rho * rho - 1.0)).abs() < 1e-12);
        // Spherical R_4^0 = 6ρ⁴ - 6ρ² + 1
        let spherical = 6.0 * rho.powi(4) - 6.0 * rho * rho + 1.0;
        assert!((basis.radial(10, rho) - spherical).abs() < 1e-12);
        // Coma R_3^1 = 3ρ³ - 2ρ
        assert!((basis.radial(7, rho) - (3.0 * rho.powi(3) - 2.0 * rho)).abs() < 1e-12);
        // Every radial polynomial is 1 at the rim
        for k in 0..basis.mode_count() {
            assert!((basis.radial(k, 1.0) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_noll_normalisation_factor() {
        let basis = ZernikeBasis::new(4);
        assert!((basis.radial(0, 0.3) - 1.0).abs() < 1e-12);
        assert!((basis.radial(3, 1.0) - 3.0_f64.sqrt()).abs() < 1e-12);
        assert!((basis.radial(1, 1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_angular_parts() {
        let basis = ZernikeBasis::new(4);
        let theta: f64 = 0.4;
        assert_eq!(basis.angular(0, theta), 1.0);
        assert!((basis.angular(1, theta) - theta.cos()).abs() < 1e-12);
        assert!((basis.angular(2, theta) - theta.sin()).abs() < 1e-12);
        assert!((basis.angular(14, theta) - (4.0 * theta).sin()).abs() < 1e-12);
    }

    #[test]
    fn test_orthonormal_over_unit_disk() {
        let basis = ZernikeBasis::new(3);
        let n = 401;
        let axis = linspace(-1.0, 1.0, n);
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); basis.mode_count()];
        for &y in axis.iter() {
            for &x in axis.iter() {
                let rho = (x * x + y * y).sqrt();
                if rho <= 1.0 {
                    let theta = y.atan2(x);
                    for (k, column) in values.iter_mut().enumerate() {
                        column.push(basis.evaluate(k, rho, theta));
                    }
                }
            }
        }
        let count = values[0].len() as f64;
        for j in 0..basis.mode_count() {
            for k in 0..basis.mode_count() {
                let inner: f64 = values[j]
                    .iter()
                    .zip(&values[k])
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
                    / count;
                let expected = if j == k { 1.0 } else { 0.0 };
                assert!(
                    (inner - expected).abs() < 0.05,
                    "<Z{}, Z{}> = {}",
                    j,
                    k,
                    inner
                );
            }
        }
        // Disk area check on the sampling itself
        assert!((count / (n * n) as f64 * 4.0 - PI).abs() < 0.05);
    }

    #[test]
    fn test_mode_mask() {
        let mask = ModeMask::from_coefficients(&[0.5, 0.0, -0.2, 0.05], 0.1);
        assert!(mask.is_active(0));
        assert!(!mask.is_active(1));
        assert!(mask.is_active(2));
        assert!(!mask.is_active(3));
        assert_eq!(mask.active_count(), 2);
        assert_eq!(mask.weight(1), 0.0);

        let zero_cutoff = ModeMask::from_coefficients(&[0.5, 0.0, -0.2], 0.0);
        assert_eq!(zero_cutoff.active_count(), 2);
        assert_eq!(ModeMask::all(4).active_count(), 4);
    }

    #[test]
    fn test_cache_zeroes_masked_modes() {
        let basis = ZernikeBasis::new(2);
        let grid = CoordinateGrid::new(Cutout::at_origin((7, 9))).unwrap();
        let mask = ModeMask::from_coefficients(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], 0.0);
        let cache = BasisCache::build(&basis, &grid, &[3.0, 5.5], &[3.0, 2.5], &mask);

        assert_eq!(cache.star_count(), 2);
        assert_eq!(cache.mode_count(), 6);
        for star in 0..2 {
            for k in 0..6 {
                let image = cache.get(star, k);
                assert_eq!(image.dim(), (7, 9));
                if !mask.is_active(k) {
                    assert!(image.iter().all(|&v| v == 0.0));
                }
            }
        }

        // Piston is constant, tilt follows sin(theta) around each star
        assert!(cache.get(0, 0).iter().all(|&v| v == 1.0));
        let theta = &cache.polar(1).theta;
        assert_eq!(cache.get(1, 2), &theta.mapv(|t| t.sin()));
    }
}
