//! Host-memory reference device.
//!
//! Implements the three device seams on plain vectors. Kernels are emulated
//! block by block from the launch geometry they are given, and the matmul library
//! follows the column-major layout rules of cublasLt, so the dispatcher runs
//! unchanged against it. Work executes at submission; [`HostStream`] keeps a
//! record of every accepted submission.

use std::sync::{Mutex, PoisonError};

use half::f16;

use crate::backend_trait::{
    BackendError, BackendResult, DeviceBuffer, DeviceContext, KernelLauncher, MatmulLibrary,
};
use crate::cpu_kernels;
use crate::gpu_types::TensorDtype;
use crate::kernel_types::{
    ComputeType, GemmKernel, KernelArg, LaunchConfig, LayoutAttribute, MatmulAttribute,
    MatmulScalar,
};

pub use crate::cpu_kernels::matmul::{HostLayout, HostMatmulDesc};

// =============================================================================
// Buffers
// =============================================================================

/// Host allocation tagged with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    I8(Vec<i8>),
    I32(Vec<i32>),
    F16(Vec<f16>),
    F32(Vec<f32>),
}

impl HostBuffer {
    pub fn zeros(dtype: TensorDtype, len: usize) -> Self {
        match dtype {
            TensorDtype::I8 => HostBuffer::I8(vec![0; len]),
            TensorDtype::I32 => HostBuffer::I32(vec![0; len]),
            TensorDtype::F16 => HostBuffer::F16(vec![f16::ZERO; len]),
            TensorDtype::F32 => HostBuffer::F32(vec![0.0; len]),
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match self {
            HostBuffer::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            HostBuffer::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f16(&self) -> Option<&[f16]> {
        match self {
            HostBuffer::F16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            HostBuffer::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Raw little-endian contents, as a device copy would see them.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostBuffer::I8(v) => bytemuck::cast_slice(v),
            HostBuffer::I32(v) => bytemuck::cast_slice(v),
            HostBuffer::F16(v) => bytemuck::cast_slice(v),
            HostBuffer::F32(v) => bytemuck::cast_slice(v),
        }
    }

    /// Widen every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            HostBuffer::I8(v) => v.iter().map(|&x| x as f32).collect(),
            HostBuffer::I32(v) => v.iter().map(|&x| x as f32).collect(),
            HostBuffer::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            HostBuffer::F32(v) => v.clone(),
        }
    }
}

impl From<Vec<i8>> for HostBuffer {
    fn from(v: Vec<i8>) -> Self {
        HostBuffer::I8(v)
    }
}

impl From<Vec<i32>> for HostBuffer {
    fn from(v: Vec<i32>) -> Self {
        HostBuffer::I32(v)
    }
}

impl From<Vec<f16>> for HostBuffer {
    fn from(v: Vec<f16>) -> Self {
        HostBuffer::F16(v)
    }
}

impl From<Vec<f32>> for HostBuffer {
    fn from(v: Vec<f32>) -> Self {
        HostBuffer::F32(v)
    }
}

impl DeviceBuffer for HostBuffer {
    fn dtype(&self) -> TensorDtype {
        match self {
            HostBuffer::I8(_) => TensorDtype::I8,
            HostBuffer::I32(_) => TensorDtype::I32,
            HostBuffer::F16(_) => TensorDtype::F16,
            HostBuffer::F32(_) => TensorDtype::F32,
        }
    }

    fn len(&self) -> usize {
        match self {
            HostBuffer::I8(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
            HostBuffer::F16(v) => v.len(),
            HostBuffer::F32(v) => v.len(),
        }
    }
}

// =============================================================================
// Stream
// =============================================================================

/// One accepted unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Kernel {
        kernel: GemmKernel,
        config: LaunchConfig,
    },
    Matmul {
        desc: HostMatmulDesc,
        a: HostLayout,
        b: HostLayout,
        c: HostLayout,
        alpha: MatmulScalar,
        beta: MatmulScalar,
    },
}

/// In-order host stream.
#[derive(Debug, Default)]
pub struct HostStream {
    submissions: Mutex<Vec<Submission>>,
}

impl HostStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything accepted so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Host work completes at submission; nothing to wait for.
    pub fn synchronize(&self) -> BackendResult<()> {
        Ok(())
    }

    fn record(&self, submission: Submission) {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(submission);
    }
}

// =============================================================================
// Device
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct CpuBackend {
    ordinal: usize,
    attached: bool,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            ordinal: 0,
            attached: true,
        }
    }

    /// A device whose context can no longer be bound; every operation fails
    /// after validation with [`BackendError::Context`].
    pub fn detached() -> Self {
        Self {
            ordinal: 0,
            attached: false,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContext for CpuBackend {
    const NAME: &'static str = "cpu";

    type Stream = HostStream;
    type Buffer = HostBuffer;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn bind_to_thread(&self) -> BackendResult<()> {
        if !self.attached {
            return Err(BackendError::Context(format!(
                "host device {} is detached",
                self.ordinal
            )));
        }
        Ok(())
    }
}

impl KernelLauncher for CpuBackend {
    fn launch(
        &self,
        kernel: GemmKernel,
        config: LaunchConfig,
        stream: &HostStream,
        args: &mut [KernelArg<'_, HostBuffer>],
    ) -> BackendResult<()> {
        cpu_kernels::launch(kernel, config, args)?;
        stream.record(Submission::Kernel { kernel, config });
        Ok(())
    }
}

impl MatmulLibrary for CpuBackend {
    type Layout = HostLayout;
    type Desc = HostMatmulDesc;

    fn create_layout(
        &self,
        dtype: TensorDtype,
        rows: u64,
        cols: u64,
        ld: i64,
    ) -> BackendResult<HostLayout> {
        HostLayout::new(dtype, rows, cols, ld)
    }

    fn set_layout_attribute(
        &self,
        layout: &mut HostLayout,
        attr: LayoutAttribute,
    ) -> BackendResult<()> {
        layout.set_attribute(attr)
    }

    fn create_matmul_desc(
        &self,
        compute: ComputeType,
        scale_type: TensorDtype,
    ) -> BackendResult<HostMatmulDesc> {
        HostMatmulDesc::new(compute, scale_type)
    }

    fn set_matmul_attribute(
        &self,
        desc: &mut HostMatmulDesc,
        attr: MatmulAttribute,
    ) -> BackendResult<()> {
        desc.set_attribute(attr);
        Ok(())
    }

    fn matmul(
        &self,
        desc: &HostMatmulDesc,
        alpha: MatmulScalar,
        a: &HostBuffer,
        a_layout: &HostLayout,
        b: &HostBuffer,
        b_layout: &HostLayout,
        beta: MatmulScalar,
        c: &mut HostBuffer,
        c_layout: &HostLayout,
        stream: &HostStream,
    ) -> BackendResult<()> {
        cpu_kernels::matmul::matmul(desc, alpha, a, a_layout, b, b_layout, beta, c, c_layout)?;
        stream.record(Submission::Matmul {
            desc: *desc,
            a: *a_layout,
            b: *b_layout,
            c: *c_layout,
            alpha,
            beta,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_dtype_and_len() {
        let buf = HostBuffer::zeros(TensorDtype::F16, 6);
        assert_eq!(buf.dtype(), TensorDtype::F16);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.as_bytes().len(), 12);
        assert!(buf.as_f32().is_none());
        assert_eq!(buf.to_f32_vec(), vec![0.0; 6]);
    }

    #[test]
    fn test_detached_backend_fails_to_bind() {
        assert!(CpuBackend::new().bind_to_thread().is_ok());
        let err = CpuBackend::detached().bind_to_thread().unwrap_err();
        assert!(matches!(err, BackendError::Context(_)));
    }

    #[test]
    fn test_failed_launch_is_not_recorded() {
        let backend = CpuBackend::new();
        let stream = HostStream::new();
        let config = LaunchConfig {
            grid_dim: (1, 1, 1),
            block_dim: (2048, 1, 1),
            shared_mem_bytes: 0,
        };
        let err = backend
            .launch(GemmKernel::CalcScale, config, &stream, &mut [])
            .unwrap_err();
        assert_eq!(err.library_code(), Some(1));
        assert!(stream.submissions().is_empty());
    }
}
