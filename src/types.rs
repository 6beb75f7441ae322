//! Problem descriptions and configuration for GEMM dispatch.

use std::env;

use crate::backend_trait::Precondition;
use crate::gpu_types::MatrixShape;
use crate::kernel_types::{MAX_BLOCK_THREADS, WARP_SIZE};
use crate::validation::checked_area;

/// Environment override for [`DispatchConfig::max_block_threads`].
pub const BLOCK_THREADS_ENV: &str = "GLLM_QGEMM_BLOCK_THREADS";

/// Dispatch-wide launch configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Upper bound on threads per block for the row kernels.
    /// Must be a positive multiple of 32, at most 1024.
    pub max_block_threads: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_block_threads: MAX_BLOCK_THREADS,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), Precondition> {
        let threads = self.max_block_threads;
        if threads == 0 || threads % WARP_SIZE != 0 || threads > MAX_BLOCK_THREADS {
            return Err(Precondition::InvalidConfig(format!(
                "max_block_threads {threads} must be a multiple of {WARP_SIZE} in 1..={MAX_BLOCK_THREADS}"
            )));
        }
        Ok(())
    }

    /// Default config with environment overrides applied; rejects bad overrides.
    pub fn try_from_env() -> Result<Self, Precondition> {
        let mut config = Self::default();
        if let Ok(value) = env::var(BLOCK_THREADS_ENV) {
            let value = value.trim();
            config.max_block_threads = value.parse::<u32>().map_err(|_| {
                Precondition::InvalidConfig(format!("{BLOCK_THREADS_ENV}={value} is not a number"))
            })?;
            config.validate()?;
        }
        Ok(config)
    }

    /// Like [`DispatchConfig::try_from_env`], but falls back to defaults on a bad override.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Ignoring {BLOCK_THREADS_ENV} override: {err}");
                Self::default()
            }
        }
    }
}

/// Logical shape of a batched matmul.
///
/// Row-major storage per batch slice:
/// - A: `(batch_a, k, m)`, or `(batch_a, m, k)` when `transpose_a`
/// - B: `(batch_b, n, k)`, or `(batch_b, k, n)` when `transpose_b`
/// - out: `(max(batch_a, batch_b), n, m)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GemmProblem {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub batch_a: usize,
    pub batch_b: usize,
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl GemmProblem {
    pub fn new(m: usize, k: usize, n: usize) -> Self {
        Self {
            m,
            k,
            n,
            batch_a: 1,
            batch_b: 1,
            transpose_a: false,
            transpose_b: false,
        }
    }

    pub fn with_batch(mut self, batch_a: usize, batch_b: usize) -> Self {
        self.batch_a = batch_a;
        self.batch_b = batch_b;
        self
    }

    pub fn with_transpose(mut self, transpose_a: bool, transpose_b: bool) -> Self {
        self.transpose_a = transpose_a;
        self.transpose_b = transpose_b;
        self
    }

    /// Effective batch count: `max(batch_a, batch_b)`.
    pub fn batch_count(&self) -> usize {
        self.batch_a.max(self.batch_b)
    }

    pub fn a_shape(&self) -> MatrixShape {
        if self.transpose_a {
            MatrixShape::new(self.batch_a, self.m, self.k)
        } else {
            MatrixShape::new(self.batch_a, self.k, self.m)
        }
    }

    pub fn b_shape(&self) -> MatrixShape {
        if self.transpose_b {
            MatrixShape::new(self.batch_b, self.k, self.n)
        } else {
            MatrixShape::new(self.batch_b, self.n, self.k)
        }
    }

    pub fn out_shape(&self) -> MatrixShape {
        MatrixShape::new(self.batch_count(), self.n, self.m)
    }
}

/// Independent broadcast flags of the rescale step.
///
/// A set flag replaces the corresponding scale vector with 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RescaleBroadcast {
    pub x: bool,
    pub y: bool,
}

impl RescaleBroadcast {
    pub const NONE: Self = Self { x: false, y: false };
    pub const X: Self = Self { x: true, y: false };
    pub const Y: Self = Self { x: false, y: true };
    pub const BOTH: Self = Self { x: true, y: true };
}

/// Element counts of the scratch buffers the quantized pipeline needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkspaceRequirements {
    /// int8 copy of A.
    pub a_q: usize,
    /// int8 copy of B.
    pub b_q: usize,
    /// f32, `(batch, m)`.
    pub scale_a: usize,
    /// f32, `(batch, n)`.
    pub scale_b: usize,
    /// int32 accumulator, `(batch, n, m)`.
    pub acc: usize,
}

impl WorkspaceRequirements {
    pub fn for_problem(problem: &GemmProblem) -> Result<Self, Precondition> {
        let batch = problem.batch_count();
        Ok(Self {
            a_q: problem.a_shape().numel()?,
            b_q: problem.b_shape().numel()?,
            scale_a: checked_area(batch, problem.m, "scale_a")?,
            scale_b: checked_area(batch, problem.n, "scale_b")?,
            acc: problem.out_shape().numel()?,
        })
    }
}

/// Caller-owned scratch for [`crate::GemmDispatcher::quantized_matmul`].
#[derive(Debug)]
pub struct QuantWorkspace<M> {
    pub a_q: M,
    pub b_q: M,
    pub scale_a: M,
    pub scale_b: M,
    pub acc: M,
}

impl<M> QuantWorkspace<M> {
    pub fn new(a_q: M, b_q: M, scale_a: M, scale_b: M, acc: M) -> Self {
        Self {
            a_q,
            b_q,
            scale_a,
            scale_b,
            acc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_shapes() {
        let p = GemmProblem::new(8, 12, 4).with_batch(1, 3);
        assert_eq!(p.batch_count(), 3);
        assert_eq!(p.a_shape(), MatrixShape::new(1, 12, 8));
        assert_eq!(p.b_shape(), MatrixShape::new(3, 4, 12));
        assert_eq!(p.out_shape(), MatrixShape::new(3, 4, 8));

        let t = p.with_transpose(true, true);
        assert_eq!(t.a_shape(), MatrixShape::new(1, 8, 12));
        assert_eq!(t.b_shape(), MatrixShape::new(3, 12, 4));
    }

    #[test]
    fn test_workspace_requirements() {
        let p = GemmProblem::new(8, 12, 4).with_batch(2, 2);
        let req = WorkspaceRequirements::for_problem(&p).unwrap();
        assert_eq!(req.a_q, 2 * 12 * 8);
        assert_eq!(req.b_q, 2 * 4 * 12);
        assert_eq!(req.scale_a, 16);
        assert_eq!(req.scale_b, 8);
        assert_eq!(req.acc, 64);
    }

    #[test]
    fn test_workspace_requirements_overflow() {
        let p = GemmProblem::new(usize::MAX / 2, 4, 4);
        assert!(matches!(
            WorkspaceRequirements::for_problem(&p),
            Err(Precondition::Overflow { .. })
        ));

        let p = GemmProblem::new(4, 4, 4).with_batch(usize::MAX, usize::MAX);
        assert!(WorkspaceRequirements::for_problem(&p).is_err());
    }

    #[test]
    fn test_dispatch_config_validation() {
        assert!(DispatchConfig::default().validate().is_ok());
        assert!(DispatchConfig { max_block_threads: 256 }.validate().is_ok());
        assert!(DispatchConfig { max_block_threads: 0 }.validate().is_err());
        assert!(DispatchConfig { max_block_threads: 100 }.validate().is_err());
        assert!(DispatchConfig { max_block_threads: 2048 }.validate().is_err());
    }
}
