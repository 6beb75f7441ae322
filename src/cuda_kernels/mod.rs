//! Kernel function table for the gemm module and driver status mapping.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaFunction, CudaModule, DriverError};

use crate::backend_trait::{BackendError, BackendResult};
use crate::kernel_types::GemmKernel;

mod cublaslt;

pub(crate) use cublaslt::{CudaLayout, CudaMatmulDesc, LtHandle, MatmulCall};

/// Driver failures that carry a status code surface as library errors.
pub(crate) fn driver_status(call: &'static str) -> impl FnOnce(DriverError) -> BackendError {
    move |err| BackendError::Library {
        call,
        code: err.0 as i32,
    }
}

/// The five gemm entry points, resolved from a loaded module.
#[derive(Debug)]
pub(crate) struct GemmFunctions {
    functions: HashMap<GemmKernel, CudaFunction>,
}

impl GemmFunctions {
    pub(crate) fn load(module: &Arc<CudaModule>) -> BackendResult<Self> {
        let mut functions = HashMap::with_capacity(GemmKernel::ALL.len());
        for kernel in GemmKernel::ALL {
            let func = module.load_function(kernel.symbol()).map_err(|err| {
                BackendError::Cuda(format!("kernel {} missing: {err:?}", kernel.symbol()))
            })?;
            functions.insert(kernel, func);
        }
        Ok(Self { functions })
    }

    pub(crate) fn get(&self, kernel: GemmKernel) -> BackendResult<&CudaFunction> {
        self.functions
            .get(&kernel)
            .ok_or_else(|| BackendError::Cuda(format!("kernel {} not loaded", kernel.symbol())))
    }
}
