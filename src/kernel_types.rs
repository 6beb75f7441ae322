//! Kernel-related types shared across backends and the dispatcher.

use half::f16;

use crate::gpu_types::TensorDtype;

/// Threads per warp; the transposed scale kernel tiles columns by this width.
pub const WARP_SIZE: u32 = 32;

/// Hardware cap on threads per block.
pub const MAX_BLOCK_THREADS: u32 = 1024;

/// Hardware cap on the y and z grid dimensions.
pub const MAX_GRID_YZ: u32 = 65535;

/// Largest magnitude an int8 quantized value takes (symmetric range).
pub const INT8_QMAX: f32 = 127.0;

/// Trait for working float types the host kernels run on.
/// Implemented for f32 and half::f16. Zero-cost via monomorphization.
pub trait KernelFloat: Copy + Default + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl KernelFloat for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 { self }
    #[inline(always)]
    fn from_f32(v: f32) -> Self { v }
}

impl KernelFloat for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 { f16::to_f32(self) }
    #[inline(always)]
    fn from_f32(v: f32) -> Self { f16::from_f32(v) }
}

/// Kernel entry points of the gemm module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmKernel {
    /// Per-row quantization, scale shape (batch, n).
    Round,
    /// Per-column quantization, scale shape (batch, m).
    RoundTranspose,
    /// Accumulator rescale with independent row/column broadcast.
    Scale,
    /// Per-row absmax scale.
    CalcScale,
    /// Per-column absmax scale, 32x32 tiles with pairwise reduction.
    CalcScaleTranspose,
}

impl GemmKernel {
    pub const ALL: [GemmKernel; 5] = [
        GemmKernel::Round,
        GemmKernel::RoundTranspose,
        GemmKernel::Scale,
        GemmKernel::CalcScale,
        GemmKernel::CalcScaleTranspose,
    ];

    /// Exported symbol in the compiled kernel module.
    pub const fn symbol(self) -> &'static str {
        match self {
            GemmKernel::Round => "cu_gemm_round",
            GemmKernel::RoundTranspose => "cu_gemm_round_transpose",
            GemmKernel::Scale => "cu_gemm_scale",
            GemmKernel::CalcScale => "cu_gemm_calc_scale",
            GemmKernel::CalcScaleTranspose => "cu_gemm_calc_scale_transpose",
        }
    }

    /// Argument list shape: `(batch, n, m, inputs.., out, flags..)` as
    /// `(inputs, flags)` counts.
    pub const fn signature(self) -> (usize, usize) {
        match self {
            GemmKernel::Round | GemmKernel::RoundTranspose => (2, 0),
            GemmKernel::Scale => (3, 2),
            GemmKernel::CalcScale | GemmKernel::CalcScaleTranspose => (1, 0),
        }
    }
}

/// Grid/block geometry of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    pub fn block_threads(&self) -> u64 {
        self.block_dim.0 as u64 * self.block_dim.1 as u64 * self.block_dim.2 as u64
    }

    pub fn grid_blocks(&self) -> u64 {
        self.grid_dim.0 as u64 * self.grid_dim.1 as u64 * self.grid_dim.2 as u64
    }
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, M> {
    I32(i32),
    Bool(bool),
    Buffer(&'a M),
    BufferMut(&'a mut M),
}

/// cublasOperation_t
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    NoTranspose,
    Transpose,
}

/// cublasComputeType_t subset used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    /// CUBLAS_COMPUTE_32I
    I32,
    /// CUBLAS_COMPUTE_16F
    F16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutAttribute {
    BatchCount(i32),
    StridedBatchOffset(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulAttribute {
    TransA(Operation),
    TransB(Operation),
}

/// Alpha/beta scalar in the descriptor's scale type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulScalar {
    I32(i32),
    /// Raw fp16 bit pattern.
    F16Bits(u16),
}

impl MatmulScalar {
    pub fn dtype(self) -> TensorDtype {
        match self {
            MatmulScalar::I32(_) => TensorDtype::I32,
            MatmulScalar::F16Bits(_) => TensorDtype::F16,
        }
    }

    /// Bytes handed to the library by pointer.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MatmulScalar::I32(v) => bytemuck::bytes_of(v),
            MatmulScalar::F16Bits(v) => bytemuck::bytes_of(v),
        }
    }

    pub fn to_f32(self) -> f32 {
        match self {
            MatmulScalar::I32(v) => v as f32,
            MatmulScalar::F16Bits(bits) => f16::from_bits(bits).to_f32(),
        }
    }
}

/// Operand precision of a batched matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulPrecision {
    /// int8 x int8 -> int32, int32 accumulation.
    Int8,
    /// fp16 x fp16 -> fp16, fp16 accumulation.
    Fp16,
}

impl MatmulPrecision {
    pub const fn operand_dtype(self) -> TensorDtype {
        match self {
            MatmulPrecision::Int8 => TensorDtype::I8,
            MatmulPrecision::Fp16 => TensorDtype::F16,
        }
    }

    pub const fn output_dtype(self) -> TensorDtype {
        match self {
            MatmulPrecision::Int8 => TensorDtype::I32,
            MatmulPrecision::Fp16 => TensorDtype::F16,
        }
    }

    pub const fn compute_type(self) -> ComputeType {
        match self {
            MatmulPrecision::Int8 => ComputeType::I32,
            MatmulPrecision::Fp16 => ComputeType::F16,
        }
    }

    pub const fn scale_type(self) -> TensorDtype {
        self.output_dtype()
    }

    /// Required divisor of m, k and n.
    pub const fn alignment(self) -> usize {
        match self {
            MatmulPrecision::Int8 => 4,
            MatmulPrecision::Fp16 => 2,
        }
    }

    pub fn alpha(self) -> MatmulScalar {
        match self {
            MatmulPrecision::Int8 => MatmulScalar::I32(1),
            MatmulPrecision::Fp16 => MatmulScalar::F16Bits(f16::ONE.to_bits()),
        }
    }

    pub fn beta(self) -> MatmulScalar {
        match self {
            MatmulPrecision::Int8 => MatmulScalar::I32(0),
            MatmulPrecision::Fp16 => MatmulScalar::F16Bits(f16::ZERO.to_bits()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp16_scalars_are_half_bit_patterns() {
        assert_eq!(MatmulPrecision::Fp16.alpha(), MatmulScalar::F16Bits(15360));
        assert_eq!(MatmulPrecision::Fp16.beta(), MatmulScalar::F16Bits(0));
        assert_eq!(MatmulPrecision::Fp16.alpha().to_f32(), 1.0);
    }

    #[test]
    fn test_int8_scalars() {
        let alpha = MatmulPrecision::Int8.alpha();
        assert_eq!(alpha, MatmulScalar::I32(1));
        assert_eq!(alpha.as_bytes(), &1i32.to_ne_bytes());
        assert_eq!(MatmulPrecision::Int8.beta().as_bytes(), &[0u8; 4]);
    }

    #[test]
    fn test_precision_types() {
        assert_eq!(MatmulPrecision::Int8.compute_type(), ComputeType::I32);
        assert_eq!(MatmulPrecision::Int8.scale_type(), TensorDtype::I32);
        assert_eq!(MatmulPrecision::Fp16.compute_type(), ComputeType::F16);
        assert_eq!(MatmulPrecision::Fp16.scale_type(), TensorDtype::F16);
        assert_eq!(MatmulPrecision::Int8.alignment(), 4);
        assert_eq!(MatmulPrecision::Fp16.alignment(), 2);
    }

    #[test]
    fn test_kernel_symbols_are_unique() {
        let mut names: Vec<_> = GemmKernel::ALL.iter().map(|k| k.symbol()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), GemmKernel::ALL.len());
    }
}
