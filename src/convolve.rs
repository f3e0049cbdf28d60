/// 2D convolution of model images with fixed kernels
/// The image may carry derivative information (any `Scalar`); the kernel is
/// always a plain `f64` array, typically a reference pixel-response image.
use ndarray::{Array2, ArrayView2};

use crate::dual::Scalar;

/// Mode for handling edges in convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvolveMode {
    /// Every partial overlap: `(rows + k_rows - 1, cols + k_cols - 1)`
    Full,
    /// Centered on the image, same shape as the input
    #[default]
    Same,
    /// Only positions where the kernel fully overlaps the image
    Valid,
}

/// True 2D convolution (kernel flipped) of `image` with `kernel`.
///
/// Output sizes follow the usual full/same/valid conventions; a `Valid`
/// convolution with a kernel larger than the image yields an empty array.
pub fn convolve2d<S: Scalar>(
    image: &ArrayView2<S>,
    kernel: &ArrayView2<f64>,
    mode: ConvolveMode,
) -> Array2<S> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();

    if img_rows == 0 || img_cols == 0 || ker_rows == 0 || ker_cols == 0 {
        return Array2::zeros((0, 0));
    }

    // Offset of output (0, 0) within the full convolution
    let (out_rows, out_cols, row_offset, col_offset) = match mode {
        ConvolveMode::Full => (img_rows + ker_rows - 1, img_cols + ker_cols - 1, 0, 0),
        ConvolveMode::Same => (img_rows, img_cols, (ker_rows - 1) / 2, (ker_cols - 1) / 2),
        ConvolveMode::Valid => {
            if ker_rows > img_rows || ker_cols > img_cols {
                return Array2::zeros((0, 0));
            }
            (
                img_rows - ker_rows + 1,
                img_cols - ker_cols + 1,
                ker_rows - 1,
                ker_cols - 1,
            )
        }
    };

    let mut output = Array2::zeros((out_rows, out_cols));

    for ((i, j), out) in output.indexed_iter_mut() {
        let fi = (i + row_offset) as isize;
        let fj = (j + col_offset) as isize;
        let mut sum = S::zero();

        for ki in 0..ker_rows {
            let img_row = fi - ki as isize;
            if img_row < 0 || img_row >= img_rows as isize {
                continue;
            }
            for kj in 0..ker_cols {
                let img_col = fj - kj as isize;
                if img_col < 0 || img_col >= img_cols as isize {
                    continue;
                }
                let weight = kernel[[ki, kj]];
                if weight != 0.0 {
                    sum += image[[img_row as usize, img_col as usize]] * S::constant(weight);
                }
            }
        }

        *out = sum;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dual::{tangent, Dual};
    use ndarray::array;

    #[test]
    fn test_full_convolution() {
        let image = array![[1.0, 2.0], [3.0, 4.0]];
        let kernel = array![[1.0, 1.0]];

        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Full);
        let expected = array![[1.0, 3.0, 2.0], [3.0, 7.0, 4.0]];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_kernel_is_flipped() {
        let image = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let kernel = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];

        // An impulse reproduces the kernel unflipped
        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Same);
        assert_eq!(result, kernel);
    }

    #[test]
    fn test_valid_convolution() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let kernel = array![[1.0, 0.0], [0.0, 1.0]];

        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Valid);
        let expected = array![[1.0 + 5.0, 2.0 + 6.0], [4.0 + 8.0, 5.0 + 9.0]];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_same_keeps_shape_with_large_kernel() {
        let image = Array2::from_elem((4, 5), 1.0);
        let kernel = Array2::from_elem((9, 9), 1.0 / 81.0);
        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Same);
        assert_eq!(result.dim(), (4, 5));

        let valid = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Valid);
        assert_eq!(valid.dim(), (0, 0));
    }

    #[test]
    fn test_delta_kernel_is_identity() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Same);
        assert_eq!(result, image);
    }

    #[test]
    fn test_derivatives_pass_through() {
        let image = array![[Dual::new(1.0, 1.0), Dual::new(2.0, 0.0)]];
        let kernel = array![[0.5, 0.25]];
        let result = convolve2d(&image.view(), &kernel.view(), ConvolveMode::Full);
        assert_eq!(result.dim(), (1, 3));
        let parts: Vec<(f64, f64)> = result.iter().map(|d| (d.value(), tangent(d))).collect();
        assert_eq!(parts, vec![(0.5, 0.5), (0.25 + 1.0, 0.25), (0.5, 0.0)]);
    }
}
