//! Device collaborator traits and the error taxonomy of the dispatch layer.
//!
//! The dispatcher never owns a device. It borrows one through three seams:
//! - [`DeviceContext`]: binding the device to the calling thread, stream/buffer types
//! - [`KernelLauncher`]: the five named quantization kernels
//! - [`MatmulLibrary`]: layout/descriptor objects and the batched matmul entry point
//!
//! Errors fall into three kinds: precondition violations (caught before any device
//! call), library failures (carry the native status code) and context failures
//! (propagated unchanged). Nothing is retried.

use thiserror::Error;

use crate::gpu_types::{MatrixShape, TensorDtype};
use crate::kernel_types::{
    ComputeType, GemmKernel, KernelArg, LaunchConfig, LayoutAttribute, MatmulAttribute,
    MatmulScalar,
};

/// A violated precondition, detected before anything is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("{name} must be > 0")]
    ZeroDim { name: &'static str },
    #[error("{name} = {value} is not a multiple of {align} ({dtype:?} operands)")]
    Misaligned {
        name: &'static str,
        value: usize,
        align: usize,
        dtype: TensorDtype,
    },
    #[error("incompatible batch counts: batch_a = {batch_a}, batch_b = {batch_b}")]
    BatchMismatch { batch_a: usize, batch_b: usize },
    #[error("{op} does not broadcast batches: batch_a = {batch_a}, batch_b = {batch_b}")]
    BroadcastUnsupported {
        op: &'static str,
        batch_a: usize,
        batch_b: usize,
    },
    #[error("{name} holds {actual} elements, needs {expected}")]
    BufferTooSmall {
        name: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("{name} has dtype {actual:?}, expected {expected}")]
    DtypeMismatch {
        name: &'static str,
        actual: TensorDtype,
        expected: &'static str,
    },
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        actual: MatrixShape,
        expected: MatrixShape,
    },
    #[error("{name} = {value} overflows the device index type")]
    Overflow { name: &'static str, value: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("precondition violated: {0}")]
    Precondition(#[from] Precondition),
    #[error("{call} failed with library status {code}")]
    Library { call: &'static str, code: i32 },
    #[error("device context unavailable: {0}")]
    Context(String),
    #[error("cuda driver error: {0}")]
    Cuda(String),
}

impl BackendError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, BackendError::Precondition(_))
    }

    /// Native status code for library failures.
    pub fn library_code(&self) -> Option<i32> {
        match self {
            BackendError::Library { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for BackendError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        BackendError::Cuda(format!("{err:?}"))
    }
}

/// Memory owned by a device. Lengths are in elements of [`DeviceBuffer::dtype`].
pub trait DeviceBuffer: Send + Sync {
    fn dtype(&self) -> TensorDtype;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The device and its execution streams.
///
/// Passed explicitly to every call; there is no process-wide current device.
pub trait DeviceContext: Send + Sync {
    const NAME: &'static str;

    type Stream;
    type Buffer: DeviceBuffer;

    fn ordinal(&self) -> usize;

    /// Make this device current on the calling thread.
    fn bind_to_thread(&self) -> BackendResult<()>;
}

/// Named kernel entry points.
pub trait KernelLauncher: DeviceContext {
    /// Queue `kernel` on `stream`. Returns once the launch is submitted.
    fn launch(
        &self,
        kernel: GemmKernel,
        config: LaunchConfig,
        stream: &Self::Stream,
        args: &mut [KernelArg<'_, Self::Buffer>],
    ) -> BackendResult<()>;
}

/// cublasLt-shaped matmul library bound to the device.
///
/// Layouts are column-major. `Layout` and `Desc` handles release their library
/// objects on drop.
pub trait MatmulLibrary: DeviceContext {
    type Layout;
    type Desc;

    fn create_layout(
        &self,
        dtype: TensorDtype,
        rows: u64,
        cols: u64,
        ld: i64,
    ) -> BackendResult<Self::Layout>;

    fn set_layout_attribute(
        &self,
        layout: &mut Self::Layout,
        attr: LayoutAttribute,
    ) -> BackendResult<()>;

    /// Three-argument form: accumulation type plus alpha/beta scale type.
    fn create_matmul_desc(
        &self,
        compute: ComputeType,
        scale_type: TensorDtype,
    ) -> BackendResult<Self::Desc>;

    fn set_matmul_attribute(&self, desc: &mut Self::Desc, attr: MatmulAttribute)
        -> BackendResult<()>;

    /// `c = alpha * op(a) * op(b) + beta * c` for every batch, queued on `stream`.
    #[allow(clippy::too_many_arguments)]
    fn matmul(
        &self,
        desc: &Self::Desc,
        alpha: MatmulScalar,
        a: &Self::Buffer,
        a_layout: &Self::Layout,
        b: &Self::Buffer,
        b_layout: &Self::Layout,
        beta: MatmulScalar,
        c: &mut Self::Buffer,
        c_layout: &Self::Layout,
        stream: &Self::Stream,
    ) -> BackendResult<()>;
}

/// Everything the dispatcher needs from a device.
pub trait GemmBackend: KernelLauncher + MatmulLibrary {}

impl<T: KernelLauncher + MatmulLibrary> GemmBackend for T {}
