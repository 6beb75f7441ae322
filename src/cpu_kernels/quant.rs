//! Scale, quantize and rescale kernels.

use half::f16;
use rayon::prelude::*;

use super::{invalid_launch, require_len, Grid};
use crate::backend_trait::BackendResult;
use crate::cpu_backend::HostBuffer;
use crate::kernel_types::{KernelFloat, INT8_QMAX, WARP_SIZE};

/// Element types a rescale accumulator can hold.
trait Accumulator: Copy + Send + Sync {
    fn load(self) -> f32;
}

impl Accumulator for i32 {
    #[inline(always)]
    fn load(self) -> f32 {
        self as f32
    }
}

impl Accumulator for f16 {
    #[inline(always)]
    fn load(self) -> f32 {
        self.to_f32()
    }
}

impl Accumulator for f32 {
    #[inline(always)]
    fn load(self) -> f32 {
        self
    }
}

/// Symmetric int8 quantization with round-half-to-even; a zero scale maps to 0.
#[inline]
pub(crate) fn quantize_value(value: f32, scale: f32) -> i8 {
    if scale == 0.0 {
        return 0;
    }
    (value / scale).round_ties_even().clamp(-INT8_QMAX, INT8_QMAX) as i8
}

/// `absmax / 127`, floored at the smallest positive f32 so a nonzero row never gets a zero scale.
#[inline]
pub(crate) fn scale_from_absmax(absmax: f32) -> f32 {
    if absmax > 0.0 {
        (absmax / INT8_QMAX).max(f32::from_bits(1))
    } else {
        0.0
    }
}

/// Shared-memory style max reduction: halve the active width each step.
fn tree_max(partials: &mut [f32]) -> f32 {
    let mut width = partials.len();
    while width > 1 {
        let half = width.div_ceil(2);
        for t in 0..width - half {
            partials[t] = partials[t].max(partials[t + half]);
        }
        width = half;
    }
    partials.first().copied().unwrap_or(0.0)
}

// =============================================================================
// cu_gemm_calc_scale
// =============================================================================

pub(crate) fn calc_scale(grid: &Grid, mat: &HostBuffer, out: &mut HostBuffer) -> BackendResult<()> {
    let out = match out {
        HostBuffer::F32(v) => v.as_mut_slice(),
        _ => return Err(invalid_launch()),
    };
    match mat {
        HostBuffer::F32(v) => calc_scale_rows(grid, v, out),
        HostBuffer::F16(v) => calc_scale_rows(grid, v, out),
        _ => Err(invalid_launch()),
    }
}

fn calc_scale_rows<T: KernelFloat>(grid: &Grid, mat: &[T], out: &mut [f32]) -> BackendResult<()> {
    let &Grid { batch, n, m, block, .. } = grid;
    require_len(mat.len(), batch * n * m)?;
    require_len(out.len(), batch * n)?;
    let threads = block.0;

    out[..batch * n]
        .par_iter_mut()
        .enumerate()
        .for_each(|(row, slot)| {
            let (b, i) = (row / n, row % n);
            if !grid.has_block(b, i) {
                return;
            }
            let values = &mat[row * m..(row + 1) * m];
            let mut partials: Vec<f32> = (0..threads)
                .map(|t| {
                    values
                        .iter()
                        .skip(t)
                        .step_by(threads)
                        .fold(0.0f32, |acc, v| acc.max(v.to_f32().abs()))
                })
                .collect();
            *slot = scale_from_absmax(tree_max(&mut partials));
        });
    Ok(())
}

// =============================================================================
// cu_gemm_calc_scale_transpose
// =============================================================================

pub(crate) fn calc_scale_transpose(
    grid: &Grid,
    mat: &HostBuffer,
    out: &mut HostBuffer,
) -> BackendResult<()> {
    let out = match out {
        HostBuffer::F32(v) => v.as_mut_slice(),
        _ => return Err(invalid_launch()),
    };
    match mat {
        HostBuffer::F32(v) => calc_scale_cols(grid, v, out),
        HostBuffer::F16(v) => calc_scale_cols(grid, v, out),
        _ => Err(invalid_launch()),
    }
}

/// Each block owns a tile of 32 columns; thread `(tx, ty)` scans rows
/// `ty, ty + block.1, ..` of column `tile * 32 + tx`.
fn calc_scale_cols<T: KernelFloat>(grid: &Grid, mat: &[T], out: &mut [f32]) -> BackendResult<()> {
    let &Grid { batch, n, m, block, .. } = grid;
    if block.0 != WARP_SIZE as usize {
        return Err(invalid_launch());
    }
    require_len(mat.len(), batch * n * m)?;
    require_len(out.len(), batch * m)?;
    let tile = WARP_SIZE as usize;
    let row_threads = block.1;

    out[..batch * m]
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, slot)| {
            let (b, j) = (idx / m, idx % m);
            if !grid.has_block(b, j / tile) {
                return;
            }
            let slice = &mat[b * n * m..(b + 1) * n * m];
            let mut partials: Vec<f32> = (0..row_threads)
                .map(|ty| {
                    (ty..n)
                        .step_by(row_threads)
                        .fold(0.0f32, |acc, i| acc.max(slice[i * m + j].to_f32().abs()))
                })
                .collect();
            *slot = scale_from_absmax(tree_max(&mut partials));
        });
    Ok(())
}

// =============================================================================
// cu_gemm_round / cu_gemm_round_transpose
// =============================================================================

pub(crate) fn round(
    grid: &Grid,
    mat: &HostBuffer,
    scale: &HostBuffer,
    out: &mut HostBuffer,
    per_column: bool,
) -> BackendResult<()> {
    let scale = scale.as_f32().ok_or_else(invalid_launch)?;
    let out = match out {
        HostBuffer::I8(v) => v.as_mut_slice(),
        _ => return Err(invalid_launch()),
    };
    match mat {
        HostBuffer::F32(v) => round_rows(grid, v, scale, out, per_column),
        HostBuffer::F16(v) => round_rows(grid, v, scale, out, per_column),
        _ => Err(invalid_launch()),
    }
}

fn round_rows<T: KernelFloat>(
    grid: &Grid,
    mat: &[T],
    scale: &[f32],
    out: &mut [i8],
    per_column: bool,
) -> BackendResult<()> {
    let &Grid { batch, n, m, block, .. } = grid;
    require_len(mat.len(), batch * n * m)?;
    require_len(out.len(), batch * n * m)?;
    require_len(scale.len(), if per_column { batch * m } else { batch * n })?;
    let threads = block.0;

    out[..batch * n * m]
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(row, dst)| {
            let (b, i) = (row / n, row % n);
            if !grid.has_block(b, i) {
                return;
            }
            let src = &mat[row * m..(row + 1) * m];
            for t in 0..threads {
                for j in (t..m).step_by(threads) {
                    let s = if per_column { scale[b * m + j] } else { scale[row] };
                    dst[j] = quantize_value(src[j].to_f32(), s);
                }
            }
        });
    Ok(())
}

// =============================================================================
// cu_gemm_scale
// =============================================================================

pub(crate) fn scale(
    grid: &Grid,
    mat: &HostBuffer,
    scale_x: &HostBuffer,
    scale_y: &HostBuffer,
    out: &mut HostBuffer,
    broadcast: (bool, bool),
) -> BackendResult<()> {
    let x = scale_x.as_f32().ok_or_else(invalid_launch)?;
    let y = scale_y.as_f32().ok_or_else(invalid_launch)?;
    match out {
        HostBuffer::F32(o) => rescale_into(grid, mat, x, y, o, broadcast),
        HostBuffer::F16(o) => rescale_into(grid, mat, x, y, o, broadcast),
        _ => Err(invalid_launch()),
    }
}

fn rescale_into<O: KernelFloat>(
    grid: &Grid,
    mat: &HostBuffer,
    x: &[f32],
    y: &[f32],
    out: &mut [O],
    broadcast: (bool, bool),
) -> BackendResult<()> {
    match mat {
        HostBuffer::I32(v) => rescale_rows(grid, v, x, y, out, broadcast),
        HostBuffer::F16(v) => rescale_rows(grid, v, x, y, out, broadcast),
        HostBuffer::F32(v) => rescale_rows(grid, v, x, y, out, broadcast),
        HostBuffer::I8(_) => Err(invalid_launch()),
    }
}

fn rescale_rows<A: Accumulator, O: KernelFloat>(
    grid: &Grid,
    mat: &[A],
    x: &[f32],
    y: &[f32],
    out: &mut [O],
    (broadcast_x, broadcast_y): (bool, bool),
) -> BackendResult<()> {
    let &Grid { batch, n, m, block, .. } = grid;
    require_len(mat.len(), batch * n * m)?;
    require_len(out.len(), batch * n * m)?;
    if !broadcast_x {
        require_len(x.len(), batch * n)?;
    }
    if !broadcast_y {
        require_len(y.len(), batch * m)?;
    }
    let threads = block.0;

    out[..batch * n * m]
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(row, dst)| {
            let (b, i) = (row / n, row % n);
            if !grid.has_block(b, i) {
                return;
            }
            let src = &mat[row * m..(row + 1) * m];
            let sx = if broadcast_x { 1.0 } else { x[row] };
            for t in 0..threads {
                for j in (t..m).step_by(threads) {
                    let sy = if broadcast_y { 1.0 } else { y[b * m + j] };
                    dst[j] = O::from_f32(src[j].load() * sx * sy);
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_value_rounding_and_clamp() {
        assert_eq!(quantize_value(2.5, 1.0), 2);
        assert_eq!(quantize_value(3.5, 1.0), 4);
        assert_eq!(quantize_value(-2.5, 1.0), -2);
        assert_eq!(quantize_value(500.0, 1.0), 127);
        assert_eq!(quantize_value(-500.0, 1.0), -127);
        assert_eq!(quantize_value(3.0, 0.0), 0);
    }

    #[test]
    fn test_scale_from_absmax_never_underflows() {
        assert_eq!(scale_from_absmax(0.0), 0.0);
        assert_eq!(scale_from_absmax(127.0), 1.0);
        let tiny = f32::from_bits(14);
        assert!(tiny / INT8_QMAX == 0.0);
        assert_eq!(scale_from_absmax(tiny), f32::from_bits(1));
        assert_eq!(quantize_value(tiny, scale_from_absmax(tiny)), 14);
    }

    #[test]
    fn test_tree_max_any_width() {
        for len in 1..40 {
            let mut partials: Vec<f32> = (0..len).map(|v| v as f32).collect();
            partials.reverse();
            assert_eq!(tree_max(&mut partials), (len - 1) as f32);
        }
        assert_eq!(tree_max(&mut []), 0.0);
    }
}
