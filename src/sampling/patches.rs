//! Receptive-field patch extraction for convolutional layers.
//!
//! A convolution with kernel `k` sees, at each output position, a
//! `C × k × k` window of its (zero-padded) input. Laying every window out as
//! a column gives a `(C·k·k) × (positions · batch)` matrix whose column space
//! is exactly what the kernel operates on. Rows are ordered channel-major
//! (`c·k·k + dy·k + dx`); columns iterate sample, then output row, then
//! output column.

use ndarray::{concatenate, Array2, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::core::model::LayerGeometry;
use crate::error::{GpmError, Result};

/// Output size of a convolution along one axis, `⌊(n + 2p − k)/s⌋ + 1`.
pub fn output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    let padded = input + 2 * padding;
    if padded < kernel || stride == 0 {
        return 0;
    }
    (padded - kernel) / stride + 1
}

/// Patch matrix of the first `batch` samples of `act` (`N × C × H × W`).
pub fn extract_patches(
    act: &Array4<f32>,
    geometry: &LayerGeometry,
    batch: usize,
) -> Result<Array2<f64>> {
    let (in_channels, kernel, stride, padding) = match *geometry {
        LayerGeometry::Conv {
            in_channels,
            kernel,
            stride,
            padding,
        } => (in_channels, kernel, stride, padding),
        LayerGeometry::Dense { .. } => {
            return Err(GpmError::ShapeMismatch(
                "patch extraction requested for a dense layer".to_string(),
            ))
        }
    };

    let (n, c, h, w) = act.dim();
    if c != in_channels {
        return Err(GpmError::ShapeMismatch(format!(
            "activation has {} channels, layer expects {}",
            c, in_channels
        )));
    }
    if stride == 0 {
        return Err(GpmError::InvalidConfig("convolution stride 0".to_string()));
    }

    let bsz = batch.min(n);
    let out_h = output_size(h, kernel, stride, padding);
    let out_w = output_size(w, kernel, stride, padding);
    let feat = c * kernel * kernel;
    if bsz == 0 || out_h == 0 || out_w == 0 {
        return Ok(Array2::zeros((feat, 0)));
    }

    let window = Window {
        kernel,
        stride,
        padding,
        out_h,
        out_w,
    };
    let per_sample: Vec<Array2<f64>> = (0..bsz)
        .into_par_iter()
        .map(|i| window.patches(act.index_axis(Axis(0), i)))
        .collect();

    let views: Vec<ArrayView2<f64>> = per_sample.iter().map(|m| m.view()).collect();
    concatenate(Axis(1), &views).map_err(|e| GpmError::ShapeMismatch(e.to_string()))
}

#[derive(Clone, Copy)]
struct Window {
    kernel: usize,
    stride: usize,
    padding: usize,
    out_h: usize,
    out_w: usize,
}

impl Window {
    /// Patches of one `C × H × W` sample, `(C·k·k) × (out_h·out_w)`.
    fn patches(&self, sample: ArrayView3<f32>) -> Array2<f64> {
        let (c, h, w) = sample.dim();
        let k = self.kernel;
        let mut mat = Array2::zeros((c * k * k, self.out_h * self.out_w));

        for oy in 0..self.out_h {
            for ox in 0..self.out_w {
                let col = oy * self.out_w + ox;
                for ch in 0..c {
                    for dy in 0..k {
                        // Padded coordinates shifted back into the input.
                        let y = (oy * self.stride + dy) as isize - self.padding as isize;
                        if y < 0 || y as usize >= h {
                            continue;
                        }
                        for dx in 0..k {
                            let x = (ox * self.stride + dx) as isize - self.padding as isize;
                            if x < 0 || x as usize >= w {
                                continue;
                            }
                            mat[[ch * k * k + dy * k + dx, col]] =
                                sample[[ch, y as usize, x as usize]] as f64;
                        }
                    }
                }
            }
        }
        mat
    }
}
