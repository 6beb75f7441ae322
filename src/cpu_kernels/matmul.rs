//! Host implementation of the strided-batched column-major matmul.
//!
//! Element `(r, c)` of batch `p` in a layout lives at `p * stride + r + c * ld`.
//! `C = alpha * op(A) * op(B) + beta * C` is evaluated per batch; C columns are
//! computed in parallel.

use half::f16;
use rayon::prelude::*;

use crate::backend_trait::{BackendError, BackendResult, DeviceBuffer};
use crate::cpu_backend::HostBuffer;
use crate::gpu_types::TensorDtype;
use crate::kernel_types::{ComputeType, LayoutAttribute, MatmulAttribute, MatmulScalar, Operation};

/// CUBLAS_STATUS_INVALID_VALUE
pub(crate) const STATUS_INVALID_VALUE: i32 = 7;
/// CUBLAS_STATUS_NOT_SUPPORTED
pub(crate) const STATUS_NOT_SUPPORTED: i32 = 15;

fn status(call: &'static str, code: i32) -> BackendError {
    BackendError::Library { call, code }
}

/// Column-major matrix layout, with batch attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLayout {
    pub dtype: TensorDtype,
    pub rows: u64,
    pub cols: u64,
    pub ld: i64,
    pub batch_count: i32,
    pub batch_stride: i64,
}

impl HostLayout {
    pub(crate) fn new(dtype: TensorDtype, rows: u64, cols: u64, ld: i64) -> BackendResult<Self> {
        if ld < 1 || (ld as u64) < rows {
            return Err(status("cublasLtMatrixLayoutCreate", STATUS_INVALID_VALUE));
        }
        Ok(Self {
            dtype,
            rows,
            cols,
            ld,
            batch_count: 1,
            batch_stride: 0,
        })
    }

    pub(crate) fn set_attribute(&mut self, attr: LayoutAttribute) -> BackendResult<()> {
        const CALL: &str = "cublasLtMatrixLayoutSetAttribute";
        match attr {
            LayoutAttribute::BatchCount(count) if count >= 1 => self.batch_count = count,
            LayoutAttribute::StridedBatchOffset(stride) if stride >= 0 => {
                self.batch_stride = stride
            }
            _ => return Err(status(CALL, STATUS_INVALID_VALUE)),
        }
        Ok(())
    }

    /// Elements spanned by all batches; 0 for an empty matrix.
    fn span(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            return 0;
        }
        (self.batch_count as usize - 1) * self.batch_stride as usize
            + (self.cols as usize - 1) * self.ld as usize
            + self.rows as usize
    }
}

/// Matmul descriptor: accumulation type, scalar type and operand transposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMatmulDesc {
    pub compute: ComputeType,
    pub scale_type: TensorDtype,
    pub trans_a: Operation,
    pub trans_b: Operation,
}

impl HostMatmulDesc {
    pub(crate) fn new(compute: ComputeType, scale_type: TensorDtype) -> BackendResult<Self> {
        match (compute, scale_type) {
            (ComputeType::I32, TensorDtype::I32) | (ComputeType::F16, TensorDtype::F16) => {
                Ok(Self {
                    compute,
                    scale_type,
                    trans_a: Operation::NoTranspose,
                    trans_b: Operation::NoTranspose,
                })
            }
            _ => Err(status("cublasLtMatmulDescCreate", STATUS_NOT_SUPPORTED)),
        }
    }

    pub(crate) fn set_attribute(&mut self, attr: MatmulAttribute) {
        match attr {
            MatmulAttribute::TransA(op) => self.trans_a = op,
            MatmulAttribute::TransB(op) => self.trans_b = op,
        }
    }
}

/// Index helper for one operand.
#[derive(Debug, Clone, Copy)]
struct Operand {
    ld: usize,
    stride: usize,
    transposed: bool,
}

impl Operand {
    fn new(layout: &HostLayout, op: Operation) -> Self {
        Self {
            ld: layout.ld as usize,
            stride: layout.batch_stride as usize,
            transposed: op == Operation::Transpose,
        }
    }

    /// Offset of element `(r, c)` of `op(X)` in batch `p`.
    #[inline(always)]
    fn at(&self, p: usize, r: usize, c: usize) -> usize {
        if self.transposed {
            p * self.stride + c + r * self.ld
        } else {
            p * self.stride + r + c * self.ld
        }
    }
}

/// `(rows, cols)` of `op(X)`.
fn op_dims(layout: &HostLayout, op: Operation) -> (u64, u64) {
    match op {
        Operation::NoTranspose => (layout.rows, layout.cols),
        Operation::Transpose => (layout.cols, layout.rows),
    }
}

/// Problem size after every layout and type check passed.
#[derive(Debug, Clone, Copy)]
struct Extent {
    m: usize,
    n: usize,
    k: usize,
    batch: usize,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn matmul(
    desc: &HostMatmulDesc,
    alpha: MatmulScalar,
    a: &HostBuffer,
    a_layout: &HostLayout,
    b: &HostBuffer,
    b_layout: &HostLayout,
    beta: MatmulScalar,
    c: &mut HostBuffer,
    c_layout: &HostLayout,
) -> BackendResult<()> {
    const CALL: &str = "cublasLtMatmul";
    let invalid = || status(CALL, STATUS_INVALID_VALUE);

    if alpha.dtype() != desc.scale_type || beta.dtype() != desc.scale_type {
        return Err(invalid());
    }
    let (operand, output) = match desc.compute {
        ComputeType::I32 => (TensorDtype::I8, TensorDtype::I32),
        ComputeType::F16 => (TensorDtype::F16, TensorDtype::F16),
    };
    if a_layout.dtype != operand || b_layout.dtype != operand || c_layout.dtype != output {
        return Err(status(CALL, STATUS_NOT_SUPPORTED));
    }
    if a.dtype() != a_layout.dtype || b.dtype() != b_layout.dtype || c.dtype() != c_layout.dtype {
        return Err(invalid());
    }

    let (m, k) = op_dims(a_layout, desc.trans_a);
    let (k_b, n) = op_dims(b_layout, desc.trans_b);
    if k != k_b || c_layout.rows != m || c_layout.cols != n {
        return Err(invalid());
    }
    let batch = c_layout.batch_count;
    if a_layout.batch_count != batch || b_layout.batch_count != batch {
        return Err(invalid());
    }
    if a.len() < a_layout.span() || b.len() < b_layout.span() || c.len() < c_layout.span() {
        return Err(invalid());
    }

    let extent = Extent {
        m: m as usize,
        n: n as usize,
        k: k as usize,
        batch: batch as usize,
    };
    if extent.m == 0 || extent.n == 0 {
        return Ok(());
    }
    let op_a = Operand::new(a_layout, desc.trans_a);
    let op_b = Operand::new(b_layout, desc.trans_b);
    let op_c = Operand::new(c_layout, Operation::NoTranspose);

    match (a, b, c, alpha, beta) {
        (
            HostBuffer::I8(a),
            HostBuffer::I8(b),
            HostBuffer::I32(c),
            MatmulScalar::I32(alpha),
            MatmulScalar::I32(beta),
        ) => {
            gemm_batches(extent, op_c, c, |p, i, j, prev: i32| {
                let mut acc = 0i32;
                for kk in 0..extent.k {
                    let x = a[op_a.at(p, i, kk)] as i32;
                    let y = b[op_b.at(p, kk, j)] as i32;
                    acc = acc.wrapping_add(x * y);
                }
                let scaled = alpha.wrapping_mul(acc);
                if beta == 0 {
                    scaled
                } else {
                    scaled.wrapping_add(beta.wrapping_mul(prev))
                }
            });
            Ok(())
        }
        (
            HostBuffer::F16(a),
            HostBuffer::F16(b),
            HostBuffer::F16(c),
            MatmulScalar::F16Bits(alpha),
            MatmulScalar::F16Bits(beta),
        ) => {
            let alpha = f16::from_bits(alpha).to_f32();
            let beta = f16::from_bits(beta).to_f32();
            gemm_batches(extent, op_c, c, |p, i, j, prev: f16| {
                // fp16 accumulator: every partial sum is rounded to half.
                let mut acc = f16::ZERO;
                for kk in 0..extent.k {
                    let x = a[op_a.at(p, i, kk)].to_f32();
                    let y = b[op_b.at(p, kk, j)].to_f32();
                    acc = f16::from_f32(x.mul_add(y, acc.to_f32()));
                }
                let scaled = alpha * acc.to_f32();
                if beta == 0.0 {
                    f16::from_f32(scaled)
                } else {
                    f16::from_f32(scaled + beta * prev.to_f32())
                }
            });
            Ok(())
        }
        _ => Err(invalid()),
    }
}

/// Drive `cell(batch, row, col, previous)` over every element of C.
fn gemm_batches<T, F>(extent: Extent, op_c: Operand, c: &mut [T], cell: F)
where
    T: Copy + Send + Sync,
    F: Fn(usize, usize, usize, T) -> T + Sync,
{
    let span = (extent.n - 1) * op_c.ld + extent.m;
    for p in 0..extent.batch {
        let base = op_c.at(p, 0, 0);
        c[base..base + span]
            .par_chunks_mut(op_c.ld)
            .enumerate()
            .for_each(|(j, column)| {
                for (i, slot) in column.iter_mut().take(extent.m).enumerate() {
                    *slot = cell(p, i, j, *slot);
                }
            });
    }
}
