//! GEMM dispatcher over a borrowed device.
//!
//! Every public operation validates its arguments first, then binds the device
//! to the calling thread, then submits work to the caller's stream. Nothing is
//! synchronized here: results are visible once the caller synchronizes the stream.
//!
//! Kernel argument order is fixed for all five kernels:
//! `(batch, n, m, inputs.., out, flags..)`.

use crate::backend_trait::{
    BackendResult, DeviceBuffer, DeviceContext, GemmBackend, KernelLauncher, MatmulLibrary,
    Precondition,
};
use crate::gpu_types::{MatrixMut, MatrixRef, MatrixShape, ScaleMut, ScaleRef, TensorDtype};
use crate::kernel_types::{
    GemmKernel, KernelArg, LaunchConfig, LayoutAttribute, MatmulAttribute, MatmulPrecision,
    Operation, MAX_GRID_YZ, WARP_SIZE,
};
use crate::matmul_plan::{LayoutSpec, MatmulPlan};
use crate::types::{DispatchConfig, GemmProblem, QuantWorkspace, RescaleBroadcast};
use crate::validation::{
    round_up, to_i32, validate_buffer, validate_dtype, validate_float, validate_nonzero,
    validate_same_shape, validate_scale_shape,
};

// =============================================================================
// Launch geometry
// =============================================================================

/// `(batch, n, m)` converted for the kernel parameter block.
#[derive(Debug, Clone, Copy)]
struct KernelDims {
    batch: i32,
    n: i32,
    m: i32,
}

impl KernelDims {
    fn new(shape: MatrixShape) -> Result<Self, Precondition> {
        validate_nonzero(&[
            ("batch", shape.batch),
            ("n", shape.rows),
            ("m", shape.cols),
        ])?;
        Ok(Self {
            batch: to_i32(shape.batch, "batch")?,
            n: to_i32(shape.rows, "n")?,
            m: to_i32(shape.cols, "m")?,
        })
    }

    fn args<'a, M>(self) -> [KernelArg<'a, M>; 3] {
        [
            KernelArg::I32(self.batch),
            KernelArg::I32(self.n),
            KernelArg::I32(self.m),
        ]
    }
}

fn check_grid_y(value: u32) -> Result<u32, Precondition> {
    if value > MAX_GRID_YZ {
        return Err(Precondition::Overflow {
            name: "grid y",
            value: value as usize,
        });
    }
    Ok(value)
}

/// Grid `(batch, n)`, one block per row, threads striding over `m`.
fn row_launch(dims: KernelDims, max_threads: u32) -> Result<LaunchConfig, Precondition> {
    Ok(LaunchConfig {
        grid_dim: (dims.batch as u32, check_grid_y(dims.n as u32)?, 1),
        block_dim: ((dims.m as u32).min(max_threads), 1, 1),
        shared_mem_bytes: 0,
    })
}

/// Row scale: like [`row_launch`] with the block rounded up to whole warps.
fn row_scale_launch(dims: KernelDims, max_threads: u32) -> Result<LaunchConfig, Precondition> {
    let threads = round_up(dims.m as usize, WARP_SIZE as usize).min(max_threads as usize);
    Ok(LaunchConfig {
        grid_dim: (dims.batch as u32, check_grid_y(dims.n as u32)?, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    })
}

/// Column scale: grid `(batch, ceil(m / 32))`, 32x32 threads per block.
fn col_scale_launch(dims: KernelDims) -> Result<LaunchConfig, Precondition> {
    let tiles = (dims.m as u32).div_ceil(WARP_SIZE);
    Ok(LaunchConfig {
        grid_dim: (dims.batch as u32, check_grid_y(tiles)?, 1),
        block_dim: (WARP_SIZE, WARP_SIZE, 1),
        shared_mem_bytes: 0,
    })
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Entry point for scale computation, quantization, rescale and batched matmul.
///
/// Borrows the device; several dispatchers may share one backend.
pub struct GemmDispatcher<'d, B: GemmBackend> {
    backend: &'d B,
    config: DispatchConfig,
}

impl<'d, B: GemmBackend> GemmDispatcher<'d, B> {
    pub fn new(backend: &'d B) -> Self {
        Self {
            backend,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_config(backend: &'d B, config: DispatchConfig) -> BackendResult<Self> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn backend(&self) -> &'d B {
        self.backend
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    fn launch(
        &self,
        kernel: GemmKernel,
        config: LaunchConfig,
        stream: &B::Stream,
        args: &mut [KernelArg<'_, B::Buffer>],
    ) -> BackendResult<()> {
        log::trace!(
            "{} launch {} grid={:?} block={:?}",
            B::NAME,
            kernel.symbol(),
            config.grid_dim,
            config.block_dim
        );
        self.backend.launch(kernel, config, stream, args)
    }

    // -------------------------------------------------------------------------
    // Scale computation
    // -------------------------------------------------------------------------

    /// Per-row scale of `mat (batch, n, m)` into `out (batch, n)`.
    ///
    /// `out[b][i] = max_j |mat[b][i][j]| / 127`.
    pub fn compute_row_scale(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        out: ScaleMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        validate_float("matrix", mat.dtype())?;
        validate_scale_shape("scale", out.shape(), (shape.batch, shape.rows))?;
        let dims = KernelDims::new(shape)?;
        let config = row_scale_launch(dims, self.config.max_block_threads)?;

        self.backend.bind_to_thread()?;
        let [batch, n, m] = dims.args();
        let mut args = [
            batch,
            n,
            m,
            KernelArg::Buffer(mat.buffer()),
            KernelArg::BufferMut(out.into_buffer()),
        ];
        self.launch(GemmKernel::CalcScale, config, stream, &mut args)
    }

    /// Per-column scale of `mat (batch, n, m)` into `out (batch, m)`.
    pub fn compute_col_scale(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        out: ScaleMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        validate_float("matrix", mat.dtype())?;
        validate_scale_shape("scale", out.shape(), (shape.batch, shape.cols))?;
        let dims = KernelDims::new(shape)?;
        let config = col_scale_launch(dims)?;

        self.backend.bind_to_thread()?;
        let [batch, n, m] = dims.args();
        let mut args = [
            batch,
            n,
            m,
            KernelArg::Buffer(mat.buffer()),
            KernelArg::BufferMut(out.into_buffer()),
        ];
        self.launch(GemmKernel::CalcScaleTranspose, config, stream, &mut args)
    }

    // -------------------------------------------------------------------------
    // Quantization
    // -------------------------------------------------------------------------

    /// Quantize `mat (batch, n, m)` to int8 with a per-row `scale (batch, n)`.
    pub fn quantize_rows(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        scale: ScaleRef<'_, B::Buffer>,
        out: MatrixMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        validate_scale_shape("scale", scale.shape(), (shape.batch, shape.rows))?;
        self.quantize(GemmKernel::Round, mat, scale, out, stream)
    }

    /// Quantize `mat (batch, n, m)` to int8 with a per-column `scale (batch, m)`.
    pub fn quantize_cols(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        scale: ScaleRef<'_, B::Buffer>,
        out: MatrixMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        validate_scale_shape("scale", scale.shape(), (shape.batch, shape.cols))?;
        self.quantize(GemmKernel::RoundTranspose, mat, scale, out, stream)
    }

    fn quantize(
        &self,
        kernel: GemmKernel,
        mat: MatrixRef<'_, B::Buffer>,
        scale: ScaleRef<'_, B::Buffer>,
        out: MatrixMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        validate_float("matrix", mat.dtype())?;
        validate_dtype("output", out.dtype(), TensorDtype::I8)?;
        validate_same_shape("output", out.shape(), shape)?;
        let dims = KernelDims::new(shape)?;
        let config = row_launch(dims, self.config.max_block_threads)?;

        self.backend.bind_to_thread()?;
        let [batch, n, m] = dims.args();
        let mut args = [
            batch,
            n,
            m,
            KernelArg::Buffer(mat.buffer()),
            KernelArg::Buffer(scale.buffer()),
            KernelArg::BufferMut(out.into_buffer()),
        ];
        self.launch(kernel, config, stream, &mut args)
    }

    // -------------------------------------------------------------------------
    // Rescale
    // -------------------------------------------------------------------------

    /// `out[b][i][j] = mat[b][i][j] * x[b][i] * y[b][j]`.
    ///
    /// `mat` is an int32, fp16 or f32 accumulator of shape `(batch, n, m)`;
    /// `scale_x` is `(batch, n)`, `scale_y` is `(batch, m)`. A broadcast flag
    /// replaces that vector with 1, and its shape is not checked.
    pub fn rescale(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        scale_x: ScaleRef<'_, B::Buffer>,
        scale_y: ScaleRef<'_, B::Buffer>,
        broadcast: RescaleBroadcast,
        out: MatrixMut<'_, B::Buffer>,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        if mat.dtype() == TensorDtype::I8 {
            return Err(Precondition::DtypeMismatch {
                name: "matrix",
                actual: TensorDtype::I8,
                expected: "i32, f16 or f32",
            }
            .into());
        }
        validate_float("output", out.dtype())?;
        validate_same_shape("output", out.shape(), shape)?;
        if !broadcast.x {
            validate_scale_shape("scale_x", scale_x.shape(), (shape.batch, shape.rows))?;
        }
        if !broadcast.y {
            validate_scale_shape("scale_y", scale_y.shape(), (shape.batch, shape.cols))?;
        }
        let dims = KernelDims::new(shape)?;
        let config = row_launch(dims, self.config.max_block_threads)?;

        self.backend.bind_to_thread()?;
        let [batch, n, m] = dims.args();
        let mut args = [
            batch,
            n,
            m,
            KernelArg::Buffer(mat.buffer()),
            KernelArg::Buffer(scale_x.buffer()),
            KernelArg::Buffer(scale_y.buffer()),
            KernelArg::BufferMut(out.into_buffer()),
            KernelArg::Bool(broadcast.x),
            KernelArg::Bool(broadcast.y),
        ];
        self.launch(GemmKernel::Scale, config, stream, &mut args)
    }

    // -------------------------------------------------------------------------
    // Batched matmul
    // -------------------------------------------------------------------------

    /// int8 x int8 -> int32 batched matmul, `out (batch, n, m)`.
    pub fn matmul_int8(
        &self,
        problem: &GemmProblem,
        a: &B::Buffer,
        b: &B::Buffer,
        out: &mut B::Buffer,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        self.matmul(problem, MatmulPrecision::Int8, a, b, out, stream)
    }

    /// fp16 x fp16 -> fp16 batched matmul with fp16 accumulation.
    pub fn matmul_fp16(
        &self,
        problem: &GemmProblem,
        a: &B::Buffer,
        b: &B::Buffer,
        out: &mut B::Buffer,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        self.matmul(problem, MatmulPrecision::Fp16, a, b, out, stream)
    }

    fn matmul(
        &self,
        problem: &GemmProblem,
        precision: MatmulPrecision,
        a: &B::Buffer,
        b: &B::Buffer,
        out: &mut B::Buffer,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let plan = MatmulPlan::new(problem, precision)?;
        let operand = precision.operand_dtype();
        validate_buffer("a", a, operand, problem.a_shape())?;
        validate_buffer("b", b, operand, problem.b_shape())?;
        validate_buffer("out", out, precision.output_dtype(), problem.out_shape())?;

        self.backend.bind_to_thread()?;
        let layout_a = self.create_layout(&plan.a)?;
        let layout_b = self.create_layout(&plan.b)?;
        let layout_c = self.create_layout(&plan.c)?;

        let mut desc = self
            .backend
            .create_matmul_desc(plan.compute, plan.scale_type)?;
        if plan.trans_a == Operation::Transpose {
            self.backend
                .set_matmul_attribute(&mut desc, MatmulAttribute::TransA(plan.trans_a))?;
        }
        if plan.trans_b == Operation::Transpose {
            self.backend
                .set_matmul_attribute(&mut desc, MatmulAttribute::TransB(plan.trans_b))?;
        }

        log::debug!(
            "{} matmul {:?}: m={} k={} n={} batch={} (a={}, b={}) trans=({:?}, {:?})",
            B::NAME,
            precision,
            problem.m,
            problem.k,
            problem.n,
            plan.c.batch_count,
            problem.batch_a,
            problem.batch_b,
            plan.trans_a,
            plan.trans_b
        );

        self.backend.matmul(
            &desc, plan.alpha, a, &layout_a, b, &layout_b, plan.beta, out, &layout_c, stream,
        )
    }

    fn create_layout(&self, spec: &LayoutSpec) -> BackendResult<B::Layout> {
        let mut layout = self
            .backend
            .create_layout(spec.dtype, spec.rows, spec.cols, spec.ld)?;
        self.backend
            .set_layout_attribute(&mut layout, LayoutAttribute::BatchCount(spec.batch_count))?;
        self.backend.set_layout_attribute(
            &mut layout,
            LayoutAttribute::StridedBatchOffset(spec.batch_stride),
        )?;
        Ok(layout)
    }

    // -------------------------------------------------------------------------
    // Quantized pipeline
    // -------------------------------------------------------------------------

    /// Float matmul through int8: quantize both operands, int8 matmul, rescale.
    ///
    /// A is scaled along `m` and B along `n`, so the int32 accumulator is
    /// rescaled with `x = scale_b (batch, n)` and `y = scale_a (batch, m)`.
    /// Operands and output may be f16 or f32 independently. Batches must match.
    pub fn quantized_matmul(
        &self,
        problem: &GemmProblem,
        a: &B::Buffer,
        b: &B::Buffer,
        workspace: &mut QuantWorkspace<B::Buffer>,
        out: &mut B::Buffer,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        if problem.batch_a != problem.batch_b {
            return Err(Precondition::BroadcastUnsupported {
                op: "quantized_matmul",
                batch_a: problem.batch_a,
                batch_b: problem.batch_b,
            }
            .into());
        }
        MatmulPlan::new(problem, MatmulPrecision::Int8)?;

        let batch = problem.batch_count();
        let a_shape = problem.a_shape();
        let b_shape = problem.b_shape();
        let out_shape = problem.out_shape();
        validate_float("a", a.dtype())?;
        validate_float("b", b.dtype())?;
        validate_float("out", out.dtype())?;
        validate_buffer("a", a, a.dtype(), a_shape)?;
        validate_buffer("b", b, b.dtype(), b_shape)?;
        validate_buffer("out", out, out.dtype(), out_shape)?;
        validate_buffer("a_q", &workspace.a_q, TensorDtype::I8, a_shape)?;
        validate_buffer("b_q", &workspace.b_q, TensorDtype::I8, b_shape)?;
        validate_buffer(
            "scale_a",
            &workspace.scale_a,
            TensorDtype::F32,
            MatrixShape::new(batch, 1, problem.m),
        )?;
        validate_buffer(
            "scale_b",
            &workspace.scale_b,
            TensorDtype::F32,
            MatrixShape::new(batch, 1, problem.n),
        )?;
        validate_buffer("acc", &workspace.acc, TensorDtype::I32, out_shape)?;

        let QuantWorkspace {
            a_q,
            b_q,
            scale_a,
            scale_b,
            acc,
        } = workspace;

        // m runs along rows of A when transposed, along columns otherwise.
        self.quantize_operand(
            MatrixRef::with_shape(a, a_shape)?,
            problem.transpose_a,
            scale_a,
            a_q,
            stream,
        )?;
        // n runs along columns of B when transposed, along rows otherwise.
        self.quantize_operand(
            MatrixRef::with_shape(b, b_shape)?,
            !problem.transpose_b,
            scale_b,
            b_q,
            stream,
        )?;

        self.matmul_int8(problem, a_q, b_q, acc, stream)?;

        self.rescale(
            MatrixRef::with_shape(&*acc, out_shape)?,
            ScaleRef::new(&*scale_b, batch, problem.n)?,
            ScaleRef::new(&*scale_a, batch, problem.m)?,
            RescaleBroadcast::NONE,
            MatrixMut::with_shape(out, out_shape)?,
            stream,
        )
    }

    fn quantize_operand(
        &self,
        mat: MatrixRef<'_, B::Buffer>,
        by_rows: bool,
        scale: &mut B::Buffer,
        quantized: &mut B::Buffer,
        stream: &B::Stream,
    ) -> BackendResult<()> {
        let shape = mat.shape();
        let len = if by_rows { shape.rows } else { shape.cols };
        if by_rows {
            self.compute_row_scale(mat, ScaleMut::new(&mut *scale, shape.batch, len)?, stream)?;
            self.quantize_rows(
                mat,
                ScaleRef::new(&*scale, shape.batch, len)?,
                MatrixMut::with_shape(&mut *quantized, shape)?,
                stream,
            )
        } else {
            self.compute_col_scale(mat, ScaleMut::new(&mut *scale, shape.batch, len)?, stream)?;
            self.quantize_cols(
                mat,
                ScaleRef::new(&*scale, shape.batch, len)?,
                MatrixMut::with_shape(&mut *quantized, shape)?,
                stream,
            )
        }
    }
}
