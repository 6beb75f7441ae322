//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use gllm_qgemm::{GemmProblem, HostBuffer, QuantWorkspace, TensorDtype, WorkspaceRequirements};

/// Deterministic pseudo-random values in `[-scale, scale]`.
pub fn pseudo_random(len: usize, seed: u32, scale: f32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * scale
        })
        .collect()
}

/// Small integers in `[-range, range]` for exact int8/fp16 products.
pub fn small_ints(len: usize, seed: u32, range: i32) -> Vec<i32> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            ((state >> 16) % (2 * range as u32 + 1)) as i32 - range
        })
        .collect()
}

/// Row-major reference for `out (batch, n, m) = op(B) x op(A)` as stored by the dispatcher.
pub fn reference_matmul(problem: &GemmProblem, a: &[f32], b: &[f32]) -> Vec<f32> {
    let GemmProblem {
        m,
        k,
        n,
        batch_a,
        batch_b,
        transpose_a,
        transpose_b,
    } = *problem;
    let batch = problem.batch_count();
    let mut out = vec![0.0f32; batch * n * m];

    for p in 0..batch {
        let pa = if batch_a == 1 { 0 } else { p };
        let pb = if batch_b == 1 { 0 } else { p };
        for j in 0..n {
            for i in 0..m {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    let av = if transpose_a {
                        a[pa * m * k + i * k + kk]
                    } else {
                        a[pa * k * m + kk * m + i]
                    };
                    let bv = if transpose_b {
                        b[pb * k * n + kk * n + j]
                    } else {
                        b[pb * n * k + j * k + kk]
                    };
                    acc += av * bv;
                }
                out[p * n * m + j * m + i] = acc;
            }
        }
    }
    out
}

pub fn workspace_for(problem: &GemmProblem) -> QuantWorkspace<HostBuffer> {
    let req = WorkspaceRequirements::for_problem(problem).unwrap();
    QuantWorkspace::new(
        HostBuffer::zeros(TensorDtype::I8, req.a_q),
        HostBuffer::zeros(TensorDtype::I8, req.b_q),
        HostBuffer::zeros(TensorDtype::F32, req.scale_a),
        HostBuffer::zeros(TensorDtype::F32, req.scale_b),
        HostBuffer::zeros(TensorDtype::I32, req.acc),
    )
}
