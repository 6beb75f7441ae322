//! CUDA device over cudarc.
//!
//! The gemm kernels come from a module the caller has already loaded; this
//! backend only resolves the five entry points by name. Batched matmuls go
//! through cublasLt on the caller's stream.

use std::sync::{Arc, Mutex, PoisonError};

use cudarc::driver::{
    CudaContext, CudaModule, CudaSlice, CudaStream, DevicePtr, DevicePtrMut, PushKernelArg,
};

use crate::backend_trait::{
    BackendError, BackendResult, DeviceBuffer, DeviceContext, KernelLauncher, MatmulLibrary,
};
use crate::cpu_backend::HostBuffer;
use crate::cuda_kernels::{
    driver_status, CudaLayout, CudaMatmulDesc, GemmFunctions, LtHandle, MatmulCall,
};
use crate::gpu_types::TensorDtype;
use crate::kernel_types::{
    ComputeType, GemmKernel, KernelArg, LaunchConfig, LayoutAttribute, MatmulAttribute,
    MatmulScalar,
};

/// Untyped device allocation tagged with its element type.
#[derive(Debug)]
pub struct CudaBuffer {
    slice: CudaSlice<u8>,
    dtype: TensorDtype,
    len: usize,
}

impl CudaBuffer {
    pub fn alloc(stream: &Arc<CudaStream>, dtype: TensorDtype, len: usize) -> BackendResult<Self> {
        let slice = stream.alloc_zeros::<u8>(dtype.byte_len(len)?)?;
        Ok(Self { slice, dtype, len })
    }

    /// Copy a host buffer to the device.
    pub fn from_host(stream: &Arc<CudaStream>, host: &HostBuffer) -> BackendResult<Self> {
        let slice = stream.clone_htod(host.as_bytes())?;
        Ok(Self {
            slice,
            dtype: host.dtype(),
            len: host.len(),
        })
    }

    /// Copy back to the host. Synchronizes with `stream`.
    pub fn to_host(&self, stream: &Arc<CudaStream>) -> BackendResult<HostBuffer> {
        let bytes = stream.clone_dtoh(&self.slice)?;
        Ok(match self.dtype {
            TensorDtype::I8 => HostBuffer::I8(bytemuck::pod_collect_to_vec(&bytes)),
            TensorDtype::I32 => HostBuffer::I32(bytemuck::pod_collect_to_vec(&bytes)),
            TensorDtype::F16 => HostBuffer::F16(bytemuck::pod_collect_to_vec(&bytes)),
            TensorDtype::F32 => HostBuffer::F32(bytemuck::pod_collect_to_vec(&bytes)),
        })
    }
}

impl DeviceBuffer for CudaBuffer {
    fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub struct CudaBackend {
    ctx: Arc<CudaContext>,
    functions: GemmFunctions,
    lt: LtHandle,
    workspace: Mutex<Option<CudaSlice<u8>>>,
}

impl CudaBackend {
    /// Resolve the gemm entry points in `module` and create a cublasLt handle.
    pub fn new(ctx: Arc<CudaContext>, module: &Arc<CudaModule>) -> BackendResult<Self> {
        ctx.bind_to_thread()
            .map_err(|err| BackendError::Context(format!("{err:?}")))?;
        let functions = GemmFunctions::load(module)?;
        let lt = LtHandle::new()?;
        log::debug!("CUDA gemm backend ready on device {}", ctx.ordinal());
        Ok(Self {
            ctx,
            functions,
            lt,
            workspace: Mutex::new(None),
        })
    }

    /// Give cublasLt a scratch allocation of `bytes` for its algorithms.
    pub fn with_workspace(self, stream: &Arc<CudaStream>, bytes: usize) -> BackendResult<Self> {
        let slice = stream.alloc_zeros::<u8>(bytes)?;
        *self
            .workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(slice);
        Ok(self)
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

impl DeviceContext for CudaBackend {
    const NAME: &'static str = "cuda";

    type Stream = Arc<CudaStream>;
    type Buffer = CudaBuffer;

    fn ordinal(&self) -> usize {
        self.ctx.ordinal()
    }

    fn bind_to_thread(&self) -> BackendResult<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|err| BackendError::Context(format!("{err:?}")))
    }
}

impl KernelLauncher for CudaBackend {
    fn launch(
        &self,
        kernel: GemmKernel,
        config: LaunchConfig,
        stream: &Arc<CudaStream>,
        args: &mut [KernelArg<'_, CudaBuffer>],
    ) -> BackendResult<()> {
        let func = self.functions.get(kernel)?;
        let cfg = cudarc::driver::LaunchConfig {
            grid_dim: config.grid_dim,
            block_dim: config.block_dim,
            shared_mem_bytes: config.shared_mem_bytes,
        };

        let mut builder = stream.launch_builder(func);
        for arg in args.iter_mut() {
            match arg {
                KernelArg::I32(v) => {
                    builder.arg(&*v);
                }
                KernelArg::Bool(v) => {
                    builder.arg(&*v);
                }
                KernelArg::Buffer(buf) => {
                    builder.arg(&buf.slice);
                }
                KernelArg::BufferMut(buf) => {
                    builder.arg(&mut buf.slice);
                }
            }
        }
        unsafe { builder.launch(cfg) }.map_err(driver_status("cuLaunchKernel"))?;
        Ok(())
    }
}

impl MatmulLibrary for CudaBackend {
    type Layout = CudaLayout;
    type Desc = CudaMatmulDesc;

    fn create_layout(
        &self,
        dtype: TensorDtype,
        rows: u64,
        cols: u64,
        ld: i64,
    ) -> BackendResult<CudaLayout> {
        CudaLayout::new(dtype, rows, cols, ld)
    }

    fn set_layout_attribute(
        &self,
        layout: &mut CudaLayout,
        attr: LayoutAttribute,
    ) -> BackendResult<()> {
        layout.set_attribute(attr)
    }

    fn create_matmul_desc(
        &self,
        compute: ComputeType,
        scale_type: TensorDtype,
    ) -> BackendResult<CudaMatmulDesc> {
        CudaMatmulDesc::new(compute, scale_type)
    }

    fn set_matmul_attribute(
        &self,
        desc: &mut CudaMatmulDesc,
        attr: MatmulAttribute,
    ) -> BackendResult<()> {
        desc.set_attribute(attr)
    }

    fn matmul(
        &self,
        desc: &CudaMatmulDesc,
        alpha: MatmulScalar,
        a: &CudaBuffer,
        a_layout: &CudaLayout,
        b: &CudaBuffer,
        b_layout: &CudaLayout,
        beta: MatmulScalar,
        c: &mut CudaBuffer,
        c_layout: &CudaLayout,
        stream: &Arc<CudaStream>,
    ) -> BackendResult<()> {
        let mut workspace = self
            .workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (a_ptr, _a_sync) = a.slice.device_ptr(stream);
        let (b_ptr, _b_sync) = b.slice.device_ptr(stream);
        let (c_ptr, _c_sync) = c.slice.device_ptr_mut(stream);
        let (ws_ptr, ws_len, _ws_sync) = match workspace.as_mut() {
            Some(ws) => {
                let len = ws.len();
                let (ptr, sync) = ws.device_ptr_mut(stream);
                (ptr, len, Some(sync))
            }
            None => (0, 0, None),
        };

        let call = MatmulCall {
            desc,
            alpha: alpha.as_bytes(),
            beta: beta.as_bytes(),
            a: (a_ptr, a_layout),
            b: (b_ptr, b_layout),
            c: (c_ptr, c_layout),
            workspace: (ws_ptr, ws_len),
        };
        unsafe { call.run(&self.lt, stream.cu_stream() as *mut std::ffi::c_void) }
    }
}
