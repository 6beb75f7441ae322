//! gllm-qgemm: batched mixed-precision GEMM dispatch for LLM inference.
//!
//! This crate is the numeric core behind int8/fp16 linear layers:
//! - **Scale computation**: per-row / per-column absmax scales
//! - **Quantizer**: float -> int8 with a supplied scale, normal or transposed
//! - **Rescaler**: int32/fp16 accumulators back to the working float type
//! - **Batched matmul**: cublasLt-style layout negotiation, batch strides, broadcast
//!
//! Devices are reached through narrow traits ([`DeviceContext`], [`KernelLauncher`],
//! [`MatmulLibrary`]). [`CpuBackend`] implements all of them on host memory; the
//! `cuda` feature adds a cudarc/cublasLt implementation.
//!
//! # Quick Start
//!
//! ```
//! use gllm_qgemm::{CpuBackend, GemmDispatcher, HostBuffer, HostStream, MatrixRef, ScaleMut};
//!
//! let backend = CpuBackend::new();
//! let stream = HostStream::new();
//! let dispatcher = GemmDispatcher::new(&backend);
//!
//! let mat = HostBuffer::from(vec![1.0f32, 2.0, 3.0, 4.0, -1.0, -2.0, -3.0, -4.0]);
//! let mut scale = HostBuffer::zeros(gllm_qgemm::TensorDtype::F32, 2);
//! dispatcher
//!     .compute_row_scale(
//!         MatrixRef::new(&mat, 1, 2, 4)?,
//!         ScaleMut::new(&mut scale, 1, 2)?,
//!         &stream,
//!     )?;
//! assert_eq!(scale.as_f32().unwrap(), &[4.0 / 127.0, 4.0 / 127.0]);
//! # Ok::<(), gllm_qgemm::BackendError>(())
//! ```

pub mod backend_trait;
pub mod cpu_backend;
pub mod gpu_types;
pub mod kernel_dispatcher;
pub mod kernel_types;
pub mod matmul_plan;
pub mod types;
pub mod validation;

mod cpu_kernels;

// CUDA device, dynamic-loading cudarc; kernels come from a caller-supplied module
#[cfg(feature = "cuda")]
pub mod cuda_backend;
#[cfg(feature = "cuda")]
mod cuda_kernels;

pub use backend_trait::{
    BackendError, BackendResult, DeviceBuffer, DeviceContext, GemmBackend, KernelLauncher,
    MatmulLibrary, Precondition,
};
pub use cpu_backend::{CpuBackend, HostBuffer, HostLayout, HostMatmulDesc, HostStream, Submission};
pub use gpu_types::{MatrixMut, MatrixRef, MatrixShape, ScaleMut, ScaleRef, TensorDtype};
pub use kernel_dispatcher::GemmDispatcher;
pub use kernel_types::{
    ComputeType, GemmKernel, KernelArg, KernelFloat, LaunchConfig, LayoutAttribute,
    MatmulAttribute, MatmulPrecision, MatmulScalar, Operation,
};
pub use matmul_plan::{LayoutSpec, MatmulPlan};
pub use types::{DispatchConfig, GemmProblem, QuantWorkspace, RescaleBroadcast, WorkspaceRequirements};

#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaBackend, CudaBuffer};
