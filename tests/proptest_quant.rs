//! Property-based tests for scale computation and quantization.
//!
//! Invariants checked for arbitrary shapes and values:
//! - every scale is the absmax of its row/column divided by 127
//! - quantized values stay in [-127, 127] and reconstruct within half a step
//! - the element holding the absmax quantizes to +-127
//! - int8 matmul agrees with an exact integer reference

use proptest::prelude::*;

use gllm_qgemm::{
    CpuBackend, GemmDispatcher, GemmProblem, HostBuffer, HostStream, MatrixMut, MatrixRef,
    ScaleMut, ScaleRef, TensorDtype,
};

fn arb_matrix() -> impl Strategy<Value = (usize, usize, usize, Vec<f32>)> {
    (1usize..=3, 1usize..=9, 1usize..=70).prop_flat_map(|(batch, n, m)| {
        (
            Just(batch),
            Just(n),
            Just(m),
            prop::collection::vec(-1000.0f32..1000.0, batch * n * m),
        )
    })
}

fn quantize_rows(batch: usize, n: usize, m: usize, data: &[f32]) -> (Vec<f32>, Vec<i8>) {
    let backend = CpuBackend::new();
    let dispatcher = GemmDispatcher::new(&backend);
    let stream = HostStream::new();
    let mat = HostBuffer::from(data.to_vec());
    let mut scale = HostBuffer::zeros(TensorDtype::F32, batch * n);
    let mut q = HostBuffer::zeros(TensorDtype::I8, data.len());

    let mat_ref = MatrixRef::new(&mat, batch, n, m).unwrap();
    dispatcher
        .compute_row_scale(mat_ref, ScaleMut::new(&mut scale, batch, n).unwrap(), &stream)
        .unwrap();
    dispatcher
        .quantize_rows(
            mat_ref,
            ScaleRef::new(&scale, batch, n).unwrap(),
            MatrixMut::new(&mut q, batch, n, m).unwrap(),
            &stream,
        )
        .unwrap();
    (scale.as_f32().unwrap().to_vec(), q.as_i8().unwrap().to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn row_scale_is_absmax_over_127((batch, n, m, data) in arb_matrix()) {
        let (scale, _) = quantize_rows(batch, n, m, &data);
        for (row, chunk) in data.chunks(m).enumerate() {
            let absmax = chunk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            prop_assert_eq!(scale[row], absmax / 127.0);
        }
    }

    #[test]
    fn col_scale_is_absmax_over_127((batch, n, m, data) in arb_matrix()) {
        let backend = CpuBackend::new();
        let dispatcher = GemmDispatcher::new(&backend);
        let stream = HostStream::new();
        let mat = HostBuffer::from(data.clone());
        let mut scale = HostBuffer::zeros(TensorDtype::F32, batch * m);
        dispatcher
            .compute_col_scale(
                MatrixRef::new(&mat, batch, n, m).unwrap(),
                ScaleMut::new(&mut scale, batch, m).unwrap(),
                &stream,
            )
            .unwrap();

        let scale = scale.as_f32().unwrap();
        for b in 0..batch {
            for j in 0..m {
                let absmax = (0..n)
                    .map(|i| data[b * n * m + i * m + j].abs())
                    .fold(0.0f32, f32::max);
                prop_assert_eq!(scale[b * m + j], absmax / 127.0);
            }
        }
    }

    #[test]
    fn quantized_rows_reconstruct_within_half_step((batch, n, m, data) in arb_matrix()) {
        let (scale, q) = quantize_rows(batch, n, m, &data);
        for (idx, (&v, &qv)) in data.iter().zip(&q).enumerate() {
            let s = scale[idx / m];
            prop_assert!((-127..=127).contains(&qv));
            if s == 0.0 {
                prop_assert_eq!(qv, 0);
            } else {
                let err = (v - qv as f32 * s).abs();
                prop_assert!(err <= s * 0.5 + s * 1e-4, "v={} q={} s={}", v, qv, s);
            }
        }
    }

    #[test]
    fn absmax_element_hits_full_range((batch, n, m, data) in arb_matrix()) {
        let (_, q) = quantize_rows(batch, n, m, &data);
        for (chunk, qrow) in data.chunks(m).zip(q.chunks(m)) {
            let (pos, absmax) = chunk
                .iter()
                .enumerate()
                .fold((0, 0.0f32), |best, (i, v)| if v.abs() > best.1 { (i, v.abs()) } else { best });
            if absmax > 0.0 {
                prop_assert_eq!(qrow[pos].unsigned_abs(), 127);
            }
        }
    }

    #[test]
    fn int8_matmul_is_exact(
        (mq, kq, nq) in (1usize..=3, 1usize..=4, 1usize..=3),
        batch in 1usize..=3,
        ta in any::<bool>(),
        tb in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let problem = GemmProblem::new(mq * 4, kq * 4, nq * 4)
            .with_batch(batch, batch)
            .with_transpose(ta, tb);
        let mut state = seed | 1;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 255) as i32 - 127
        };
        let a: Vec<i8> = (0..problem.a_shape().numel().unwrap()).map(|_| next() as i8).collect();
        let b: Vec<i8> = (0..problem.b_shape().numel().unwrap()).map(|_| next() as i8).collect();

        let backend = CpuBackend::new();
        let dispatcher = GemmDispatcher::new(&backend);
        let stream = HostStream::new();
        let mut out = HostBuffer::zeros(TensorDtype::I32, problem.out_shape().numel().unwrap());
        dispatcher
            .matmul_int8(&problem, &HostBuffer::from(a.clone()), &HostBuffer::from(b.clone()), &mut out, &stream)
            .unwrap();
        let out = out.as_i32().unwrap();

        let (m, k, n) = (problem.m, problem.k, problem.n);
        for p in 0..batch {
            for j in 0..n {
                for i in 0..m {
                    let mut acc = 0i32;
                    for kk in 0..k {
                        let av = if ta { a[p * m * k + i * k + kk] } else { a[p * k * m + kk * m + i] };
                        let bv = if tb { b[p * k * n + kk * n + j] } else { b[p * n * k + j * k + kk] };
                        acc += av as i32 * bv as i32;
                    }
                    prop_assert_eq!(out[p * n * m + j * m + i], acc);
                }
            }
        }
    }
}
