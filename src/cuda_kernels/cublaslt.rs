//! Owned cublasLt objects.
//!
//! Every handle is destroyed on drop. Destroy failures are logged, never raised.

use std::ffi::c_void;
use std::mem::size_of;

use cudarc::cublaslt::result::{self, CublasError};
use cudarc::cublaslt::sys;

use crate::backend_trait::{BackendError, BackendResult};
use crate::gpu_types::TensorDtype;
use crate::kernel_types::{ComputeType, LayoutAttribute, MatmulAttribute, Operation};

fn status(call: &'static str) -> impl FnOnce(CublasError) -> BackendError {
    move |err| BackendError::Library {
        call,
        code: err.0 as i32,
    }
}

fn data_type(dtype: TensorDtype) -> sys::cudaDataType {
    match dtype {
        TensorDtype::I8 => sys::cudaDataType::CUDA_R_8I,
        TensorDtype::I32 => sys::cudaDataType::CUDA_R_32I,
        TensorDtype::F16 => sys::cudaDataType::CUDA_R_16F,
        TensorDtype::F32 => sys::cudaDataType::CUDA_R_32F,
    }
}

fn compute_type(compute: ComputeType) -> sys::cublasComputeType_t {
    match compute {
        ComputeType::I32 => sys::cublasComputeType_t::CUBLAS_COMPUTE_32I,
        ComputeType::F16 => sys::cublasComputeType_t::CUBLAS_COMPUTE_16F,
    }
}

fn operation(op: Operation) -> i32 {
    match op {
        Operation::NoTranspose => cudarc::cublas::sys::cublasOperation_t::CUBLAS_OP_N as i32,
        Operation::Transpose => cudarc::cublas::sys::cublasOperation_t::CUBLAS_OP_T as i32,
    }
}

#[derive(Debug)]
pub(crate) struct LtHandle(sys::cublasLtHandle_t);

unsafe impl Send for LtHandle {}
unsafe impl Sync for LtHandle {}

impl LtHandle {
    pub(crate) fn new() -> BackendResult<Self> {
        let handle = result::create_handle().map_err(status("cublasLtCreate"))?;
        Ok(Self(handle))
    }

    pub(crate) fn raw(&self) -> sys::cublasLtHandle_t {
        self.0
    }
}

impl Drop for LtHandle {
    fn drop(&mut self) {
        if let Err(err) = unsafe { result::destroy_handle(self.0) } {
            log::warn!("cublasLtDestroy failed: {err:?}");
        }
    }
}

#[derive(Debug)]
pub struct CudaLayout(sys::cublasLtMatrixLayout_t);

unsafe impl Send for CudaLayout {}
unsafe impl Sync for CudaLayout {}

impl CudaLayout {
    pub(crate) fn new(dtype: TensorDtype, rows: u64, cols: u64, ld: i64) -> BackendResult<Self> {
        let layout = result::create_matrix_layout(data_type(dtype), rows, cols, ld)
            .map_err(status("cublasLtMatrixLayoutCreate"))?;
        Ok(Self(layout))
    }

    pub(crate) fn set_attribute(&mut self, attr: LayoutAttribute) -> BackendResult<()> {
        let res = match attr {
            LayoutAttribute::BatchCount(count) => unsafe {
                result::set_matrix_layout_attribute(
                    self.0,
                    sys::cublasLtMatrixLayoutAttribute_t::CUBLASLT_MATRIX_LAYOUT_BATCH_COUNT,
                    &count as *const i32 as *const c_void,
                    size_of::<i32>(),
                )
            },
            LayoutAttribute::StridedBatchOffset(stride) => unsafe {
                result::set_matrix_layout_attribute(
                    self.0,
                    sys::cublasLtMatrixLayoutAttribute_t::CUBLASLT_MATRIX_LAYOUT_STRIDED_BATCH_OFFSET,
                    &stride as *const i64 as *const c_void,
                    size_of::<i64>(),
                )
            },
        };
        res.map_err(status("cublasLtMatrixLayoutSetAttribute"))
    }

    pub(crate) fn raw(&self) -> sys::cublasLtMatrixLayout_t {
        self.0
    }
}

impl Drop for CudaLayout {
    fn drop(&mut self) {
        if let Err(err) = unsafe { result::destroy_matrix_layout(self.0) } {
            log::warn!("cublasLtMatrixLayoutDestroy failed: {err:?}");
        }
    }
}

#[derive(Debug)]
pub struct CudaMatmulDesc(sys::cublasLtMatmulDesc_t);

unsafe impl Send for CudaMatmulDesc {}
unsafe impl Sync for CudaMatmulDesc {}

impl CudaMatmulDesc {
    pub(crate) fn new(compute: ComputeType, scale_type: TensorDtype) -> BackendResult<Self> {
        let desc = result::create_matmul_desc(compute_type(compute), data_type(scale_type))
            .map_err(status("cublasLtMatmulDescCreate"))?;
        Ok(Self(desc))
    }

    pub(crate) fn set_attribute(&mut self, attr: MatmulAttribute) -> BackendResult<()> {
        let (which, value) = match attr {
            MatmulAttribute::TransA(op) => (
                sys::cublasLtMatmulDescAttributes_t::CUBLASLT_MATMUL_DESC_TRANSA,
                operation(op),
            ),
            MatmulAttribute::TransB(op) => (
                sys::cublasLtMatmulDescAttributes_t::CUBLASLT_MATMUL_DESC_TRANSB,
                operation(op),
            ),
        };
        unsafe {
            result::set_matmul_desc_attribute(
                self.0,
                which,
                &value as *const i32 as *const c_void,
                size_of::<i32>(),
            )
        }
        .map_err(status("cublasLtMatmulDescSetAttribute"))
    }

    pub(crate) fn raw(&self) -> sys::cublasLtMatmulDesc_t {
        self.0
    }
}

impl Drop for CudaMatmulDesc {
    fn drop(&mut self) {
        if let Err(err) = unsafe { result::destroy_matmul_desc(self.0) } {
            log::warn!("cublasLtMatmulDescDestroy failed: {err:?}");
        }
    }
}

/// Raw pointers of one `cublasLtMatmul` call; C doubles as D.
pub(crate) struct MatmulCall<'a> {
    pub desc: &'a CudaMatmulDesc,
    pub alpha: &'a [u8],
    pub beta: &'a [u8],
    pub a: (u64, &'a CudaLayout),
    pub b: (u64, &'a CudaLayout),
    pub c: (u64, &'a CudaLayout),
    pub workspace: (u64, usize),
}

impl MatmulCall<'_> {
    /// # Safety
    /// Every pointer must be a live device allocation covering its layout, and
    /// `stream` must belong to the context the handle was created in.
    pub(crate) unsafe fn run(&self, handle: &LtHandle, stream: *mut c_void) -> BackendResult<()> {
        result::matmul(
            handle.raw(),
            self.desc.raw(),
            self.alpha.as_ptr() as *const c_void,
            self.beta.as_ptr() as *const c_void,
            self.a.0 as *const c_void,
            self.a.1.raw(),
            self.b.0 as *const c_void,
            self.b.1.raw(),
            self.c.0 as *const c_void,
            self.c.1.raw(),
            self.c.0 as *mut c_void,
            self.c.1.raw(),
            std::ptr::null(),
            self.workspace.0 as *mut c_void,
            self.workspace.1,
            stream as _,
        )
        .map_err(status("cublasLtMatmul"))
    }
}
