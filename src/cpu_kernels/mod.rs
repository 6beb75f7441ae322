//! Host emulation of the gemm kernel module.
//!
//! A launch is checked the way the driver checks it (block size, grid extent),
//! then the positional arguments are unpacked against the kernel's signature and
//! the grid is executed: every block that falls inside the data runs its threads'
//! strided loops. Blocks are independent and run in parallel under rayon.

pub mod matmul;
mod quant;

use crate::backend_trait::{BackendError, BackendResult};
use crate::cpu_backend::HostBuffer;
use crate::kernel_types::{GemmKernel, KernelArg, LaunchConfig, MAX_BLOCK_THREADS, MAX_GRID_YZ};

/// CUDA_ERROR_INVALID_VALUE
pub(crate) const CUDA_ERROR_INVALID_VALUE: i32 = 1;
/// CUDA_ERROR_ILLEGAL_ADDRESS
pub(crate) const CUDA_ERROR_ILLEGAL_ADDRESS: i32 = 700;

const LAUNCH_CALL: &str = "cuLaunchKernel";

pub(crate) fn invalid_launch() -> BackendError {
    BackendError::Library {
        call: LAUNCH_CALL,
        code: CUDA_ERROR_INVALID_VALUE,
    }
}

pub(crate) fn illegal_address() -> BackendError {
    BackendError::Library {
        call: LAUNCH_CALL,
        code: CUDA_ERROR_ILLEGAL_ADDRESS,
    }
}

/// Fail the launch when `buffer` holds fewer than `needed` elements.
pub(crate) fn require_len(len: usize, needed: usize) -> BackendResult<()> {
    if len < needed {
        return Err(illegal_address());
    }
    Ok(())
}

/// Grid geometry and problem dimensions of one launch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Grid {
    pub batch: usize,
    pub n: usize,
    pub m: usize,
    pub grid: (usize, usize),
    pub block: (usize, usize),
}

impl Grid {
    /// Whether block `(bx, by)` exists in the launched grid.
    #[inline]
    pub fn has_block(&self, bx: usize, by: usize) -> bool {
        bx < self.grid.0 && by < self.grid.1
    }
}

struct Unpacked<'s> {
    dims: [usize; 3],
    inputs: Vec<&'s HostBuffer>,
    out: &'s mut HostBuffer,
    flags: Vec<bool>,
}

fn check_config(config: &LaunchConfig) -> BackendResult<()> {
    let threads = config.block_threads();
    if threads == 0 || threads > MAX_BLOCK_THREADS as u64 || config.grid_blocks() == 0 {
        return Err(invalid_launch());
    }
    if config.grid_dim.1 > MAX_GRID_YZ || config.grid_dim.2 > MAX_GRID_YZ {
        return Err(invalid_launch());
    }
    Ok(())
}

fn unpack<'s>(
    kernel: GemmKernel,
    args: &'s mut [KernelArg<'_, HostBuffer>],
) -> BackendResult<Unpacked<'s>> {
    let (n_inputs, n_flags) = kernel.signature();
    if args.len() != 3 + n_inputs + 1 + n_flags {
        return Err(invalid_launch());
    }

    let (dim_args, rest) = args.split_at_mut(3);
    let mut dims = [0usize; 3];
    for (slot, arg) in dims.iter_mut().zip(dim_args.iter()) {
        match arg {
            KernelArg::I32(v) => *slot = usize::try_from(*v).map_err(|_| invalid_launch())?,
            _ => return Err(invalid_launch()),
        }
    }

    let (input_args, rest) = rest.split_at_mut(n_inputs);
    let mut inputs = Vec::with_capacity(n_inputs);
    for arg in input_args.iter() {
        match arg {
            KernelArg::Buffer(buf) => inputs.push(*buf),
            _ => return Err(invalid_launch()),
        }
    }

    let (out_arg, flag_args) = rest.split_first_mut().ok_or_else(invalid_launch)?;
    let out = match out_arg {
        KernelArg::BufferMut(buf) => &mut **buf,
        _ => return Err(invalid_launch()),
    };

    let mut flags = Vec::with_capacity(n_flags);
    for arg in flag_args.iter() {
        match arg {
            KernelArg::Bool(v) => flags.push(*v),
            _ => return Err(invalid_launch()),
        }
    }

    Ok(Unpacked {
        dims,
        inputs,
        out,
        flags,
    })
}

/// Run `kernel` over `config` with positional `args`.
pub(crate) fn launch(
    kernel: GemmKernel,
    config: LaunchConfig,
    args: &mut [KernelArg<'_, HostBuffer>],
) -> BackendResult<()> {
    check_config(&config)?;
    let Unpacked {
        dims: [batch, n, m],
        inputs,
        out,
        flags,
    } = unpack(kernel, args)?;
    if batch == 0 || n == 0 || m == 0 {
        return Ok(());
    }

    let grid = Grid {
        batch,
        n,
        m,
        grid: (config.grid_dim.0 as usize, config.grid_dim.1 as usize),
        block: (config.block_dim.0 as usize, config.block_dim.1 as usize),
    };

    match kernel {
        GemmKernel::CalcScale => quant::calc_scale(&grid, inputs[0], out),
        GemmKernel::CalcScaleTranspose => quant::calc_scale_transpose(&grid, inputs[0], out),
        GemmKernel::Round => quant::round(&grid, inputs[0], inputs[1], out, false),
        GemmKernel::RoundTranspose => quant::round(&grid, inputs[0], inputs[1], out, true),
        GemmKernel::Scale => quant::scale(
            &grid,
            inputs[0],
            inputs[1],
            inputs[2],
            out,
            (flags[0], flags[1]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_types::TensorDtype;

    fn config(grid: (u32, u32), block: (u32, u32)) -> LaunchConfig {
        LaunchConfig {
            grid_dim: (grid.0, grid.1, 1),
            block_dim: (block.0, block.1, 1),
            shared_mem_bytes: 0,
        }
    }

    #[test]
    fn test_rejects_wrong_argument_kinds() {
        let mat = HostBuffer::from(vec![1.0f32; 4]);
        let mut out = HostBuffer::zeros(TensorDtype::F32, 1);
        let mut args = [
            KernelArg::I32(1),
            KernelArg::I32(1),
            KernelArg::Bool(true),
            KernelArg::Buffer(&mat),
            KernelArg::BufferMut(&mut out),
        ];
        let err = launch(GemmKernel::CalcScale, config((1, 1), (32, 1)), &mut args).unwrap_err();
        assert_eq!(err.library_code(), Some(CUDA_ERROR_INVALID_VALUE));
    }

    #[test]
    fn test_rejects_wrong_argument_count() {
        let mat = HostBuffer::from(vec![1.0f32; 4]);
        let mut out = HostBuffer::zeros(TensorDtype::F32, 1);
        let mut args = [
            KernelArg::I32(1),
            KernelArg::I32(1),
            KernelArg::I32(4),
            KernelArg::Buffer(&mat),
            KernelArg::BufferMut(&mut out),
        ];
        let err = launch(GemmKernel::Round, config((1, 1), (4, 1)), &mut args).unwrap_err();
        assert_eq!(err.library_code(), Some(CUDA_ERROR_INVALID_VALUE));
    }

    #[test]
    fn test_short_buffer_is_illegal_address() {
        let mat = HostBuffer::from(vec![1.0f32; 3]);
        let mut out = HostBuffer::zeros(TensorDtype::F32, 1);
        let mut args = [
            KernelArg::I32(1),
            KernelArg::I32(1),
            KernelArg::I32(4),
            KernelArg::Buffer(&mat),
            KernelArg::BufferMut(&mut out),
        ];
        let err = launch(GemmKernel::CalcScale, config((1, 1), (32, 1)), &mut args).unwrap_err();
        assert_eq!(err.library_code(), Some(CUDA_ERROR_ILLEGAL_ADDRESS));
    }

    #[test]
    fn test_uncovered_rows_are_untouched() {
        // Grid covers one of two rows.
        let mat = HostBuffer::from(vec![1.0f32, -2.0, 3.0, -8.0]);
        let mut out = HostBuffer::from(vec![-1.0f32; 2]);
        let mut args = [
            KernelArg::I32(1),
            KernelArg::I32(2),
            KernelArg::I32(2),
            KernelArg::Buffer(&mat),
            KernelArg::BufferMut(&mut out),
        ];
        launch(GemmKernel::CalcScale, config((1, 1), (32, 1)), &mut args).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[2.0 / 127.0, -1.0]);
    }
}
