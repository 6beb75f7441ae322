//! Layout negotiation for the batched matmul.
//!
//! Pure computation: turns a [`GemmProblem`] and a precision into the three
//! column-major operand layouts, batch strides and descriptor settings the
//! matmul library is configured with. No device state is touched.
//!
//! Row-major `(k, m)` storage of A is the column-major `m x k` matrix with
//! leading dimension `m`, so the library computes
//! `C (m x n, col-major) = op(A) * op(B)`, which is `out (n x m, row-major)`.

use crate::backend_trait::Precondition;
use crate::gpu_types::TensorDtype;
use crate::kernel_types::{ComputeType, MatmulPrecision, MatmulScalar, Operation};
use crate::types::GemmProblem;
use crate::validation::{
    checked_area, to_i32, to_i64, validate_alignment, validate_batch_pair, validate_nonzero,
};

/// One operand's layout descriptor contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSpec {
    pub dtype: TensorDtype,
    pub rows: u64,
    pub cols: u64,
    pub ld: i64,
    pub batch_count: i32,
    /// 0 for a broadcast (batch 1) operand.
    pub batch_stride: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulPlan {
    pub precision: MatmulPrecision,
    pub a: LayoutSpec,
    pub b: LayoutSpec,
    pub c: LayoutSpec,
    pub compute: ComputeType,
    pub scale_type: TensorDtype,
    pub trans_a: Operation,
    pub trans_b: Operation,
    pub alpha: MatmulScalar,
    pub beta: MatmulScalar,
}

/// Stride between consecutive batch slices; 0 reuses the single slice.
#[inline]
pub fn batch_stride(batch: usize, slice_len: usize) -> usize {
    if batch == 1 {
        0
    } else {
        slice_len
    }
}

impl MatmulPlan {
    /// Validate `problem` for `precision` and derive every layout.
    pub fn new(problem: &GemmProblem, precision: MatmulPrecision) -> Result<Self, Precondition> {
        let GemmProblem {
            m,
            k,
            n,
            batch_a,
            batch_b,
            transpose_a,
            transpose_b,
        } = *problem;

        validate_nonzero(&[
            ("m", m),
            ("k", k),
            ("n", n),
            ("batch_a", batch_a),
            ("batch_b", batch_b),
        ])?;

        let operand = precision.operand_dtype();
        let align = precision.alignment();
        validate_alignment("m", m, align, operand)?;
        validate_alignment("n", n, align, operand)?;
        validate_alignment("k", k, align, operand)?;
        validate_batch_pair(batch_a, batch_b)?;

        let batch_count = to_i32(problem.batch_count(), "batch")?;
        let mk = checked_area(m, k, "m * k")?;
        let nk = checked_area(n, k, "n * k")?;
        let mn = checked_area(m, n, "m * n")?;

        let (a_rows, a_cols) = if transpose_a { (k, m) } else { (m, k) };
        let (b_rows, b_cols) = if transpose_b { (n, k) } else { (k, n) };

        let a = LayoutSpec {
            dtype: operand,
            rows: a_rows as u64,
            cols: a_cols as u64,
            ld: to_i64(a_rows, "lda")?,
            batch_count,
            batch_stride: to_i64(batch_stride(batch_a, mk), "stride_a")?,
        };
        let b = LayoutSpec {
            dtype: operand,
            rows: b_rows as u64,
            cols: b_cols as u64,
            ld: to_i64(b_rows, "ldb")?,
            batch_count,
            batch_stride: to_i64(batch_stride(batch_b, nk), "stride_b")?,
        };
        let c = LayoutSpec {
            dtype: precision.output_dtype(),
            rows: m as u64,
            cols: n as u64,
            ld: to_i64(m, "ldc")?,
            batch_count,
            batch_stride: to_i64(mn, "stride_c")?,
        };

        Ok(Self {
            precision,
            a,
            b,
            c,
            compute: precision.compute_type(),
            scale_type: precision.scale_type(),
            trans_a: if transpose_a { Operation::Transpose } else { Operation::NoTranspose },
            trans_b: if transpose_b { Operation::Transpose } else { Operation::NoTranspose },
            alpha: precision.alpha(),
            beta: precision.beta(),
        })
    }
}
