use approx::assert_relative_eq;
use half::f16;

use gllm_qgemm::{
    BackendError, CpuBackend, GemmDispatcher, GemmKernel, HostBuffer, HostStream, MatrixMut,
    MatrixRef, Precondition, RescaleBroadcast, ScaleRef, Submission, TensorDtype,
};

const BATCH: usize = 2;
const N: usize = 3;
const M: usize = 4;

fn accumulator() -> Vec<i32> {
    (0..(BATCH * N * M) as i32).map(|v| v - 10).collect()
}

fn scale_x() -> Vec<f32> {
    (0..BATCH * N).map(|i| 0.5 + i as f32 * 0.25).collect()
}

fn scale_y() -> Vec<f32> {
    (0..BATCH * M).map(|j| 2.0 - j as f32 * 0.125).collect()
}

fn run(
    acc: &HostBuffer,
    sx: &HostBuffer,
    sx_shape: (usize, usize),
    sy: &HostBuffer,
    sy_shape: (usize, usize),
    broadcast: RescaleBroadcast,
    out_dtype: TensorDtype,
) -> Result<HostBuffer, BackendError> {
    let backend = CpuBackend::new();
    let dispatcher = GemmDispatcher::new(&backend);
    let stream = HostStream::new();
    let mut out = HostBuffer::zeros(out_dtype, BATCH * N * M);
    dispatcher.rescale(
        MatrixRef::new(acc, BATCH, N, M)?,
        ScaleRef::new(sx, sx_shape.0, sx_shape.1)?,
        ScaleRef::new(sy, sy_shape.0, sy_shape.1)?,
        broadcast,
        MatrixMut::new(&mut out, BATCH, N, M)?,
        &stream,
    )?;
    Ok(out)
}

fn expected(broadcast: RescaleBroadcast) -> Vec<f32> {
    let (acc, sx, sy) = (accumulator(), scale_x(), scale_y());
    let mut out = Vec::with_capacity(acc.len());
    for b in 0..BATCH {
        for i in 0..N {
            for j in 0..M {
                let x = if broadcast.x { 1.0 } else { sx[b * N + i] };
                let y = if broadcast.y { 1.0 } else { sy[b * M + j] };
                out.push(acc[(b * N + i) * M + j] as f32 * x * y);
            }
        }
    }
    out
}

#[test]
fn every_broadcast_combination() {
    let acc = HostBuffer::from(accumulator());
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());

    for broadcast in [
        RescaleBroadcast::NONE,
        RescaleBroadcast::X,
        RescaleBroadcast::Y,
        RescaleBroadcast::BOTH,
    ] {
        let out = run(&acc, &sx, (BATCH, N), &sy, (BATCH, M), broadcast, TensorDtype::F32).unwrap();
        let want = expected(broadcast);
        for (got, want) in out.as_f32().unwrap().iter().zip(&want) {
            assert_relative_eq!(*got, *want, max_relative = 1e-6);
        }
    }
}

#[test]
fn broadcast_ignores_scale_contents_and_shape() {
    let acc = HostBuffer::from(accumulator());
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());
    let junk = HostBuffer::from(vec![f32::NAN]);

    let with_real = run(&acc, &sx, (BATCH, N), &sy, (BATCH, M), RescaleBroadcast::BOTH, TensorDtype::F32)
        .unwrap();
    let with_junk = run(&acc, &junk, (1, 1), &junk, (1, 1), RescaleBroadcast::BOTH, TensorDtype::F32)
        .unwrap();
    assert_eq!(with_real, with_junk);

    let x_only = run(&acc, &sx, (BATCH, N), &junk, (1, 1), RescaleBroadcast::Y, TensorDtype::F32)
        .unwrap();
    let x_real = run(&acc, &sx, (BATCH, N), &sy, (BATCH, M), RescaleBroadcast::Y, TensorDtype::F32)
        .unwrap();
    assert_eq!(x_only, x_real);
}

#[test]
fn unbroadcast_scale_shape_is_checked() {
    let acc = HostBuffer::from(accumulator());
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());

    let err = run(&acc, &sx, (BATCH, N), &sy, (BATCH, N), RescaleBroadcast::X, TensorDtype::F32)
        .unwrap_err();
    assert!(matches!(
        err,
        BackendError::Precondition(Precondition::ShapeMismatch { name: "scale_y", .. })
    ));
}

#[test]
fn f16_output_rounds_each_element() {
    let acc = HostBuffer::from(accumulator());
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());

    let out = run(&acc, &sx, (BATCH, N), &sy, (BATCH, M), RescaleBroadcast::NONE, TensorDtype::F16)
        .unwrap();
    let want: Vec<f16> = expected(RescaleBroadcast::NONE)
        .into_iter()
        .map(f16::from_f32)
        .collect();
    assert_eq!(out.as_f16().unwrap(), want.as_slice());
}

#[test]
fn f32_accumulator_is_accepted_and_int8_is_not() {
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());

    let acc32 = HostBuffer::from(accumulator().into_iter().map(|v| v as f32).collect::<Vec<_>>());
    let out = run(&acc32, &sx, (BATCH, N), &sy, (BATCH, M), RescaleBroadcast::NONE, TensorDtype::F32)
        .unwrap();
    let from_int = run(
        &HostBuffer::from(accumulator()),
        &sx,
        (BATCH, N),
        &sy,
        (BATCH, M),
        RescaleBroadcast::NONE,
        TensorDtype::F32,
    )
    .unwrap();
    assert_eq!(out, from_int);

    let acc8 = HostBuffer::from(vec![1i8; BATCH * N * M]);
    let err = run(&acc8, &sx, (BATCH, N), &sy, (BATCH, M), RescaleBroadcast::NONE, TensorDtype::F32)
        .unwrap_err();
    assert!(matches!(
        err,
        BackendError::Precondition(Precondition::DtypeMismatch { name: "matrix", .. })
    ));
}

#[test]
fn rescale_launches_one_block_per_row() {
    let backend = CpuBackend::new();
    let dispatcher = GemmDispatcher::new(&backend);
    let stream = HostStream::new();
    let acc = HostBuffer::from(accumulator());
    let sx = HostBuffer::from(scale_x());
    let sy = HostBuffer::from(scale_y());
    let mut out = HostBuffer::zeros(TensorDtype::F32, BATCH * N * M);

    dispatcher
        .rescale(
            MatrixRef::new(&acc, BATCH, N, M).unwrap(),
            ScaleRef::new(&sx, BATCH, N).unwrap(),
            ScaleRef::new(&sy, BATCH, M).unwrap(),
            RescaleBroadcast::NONE,
            MatrixMut::new(&mut out, BATCH, N, M).unwrap(),
            &stream,
        )
        .unwrap();

    let submissions = stream.submissions();
    let Submission::Kernel { kernel, config } = &submissions[0] else {
        panic!("expected a kernel submission");
    };
    assert_eq!(*kernel, GemmKernel::Scale);
    assert_eq!(config.grid_dim, (BATCH as u32, N as u32, 1));
    assert_eq!(config.block_dim, (M as u32, 1, 1));
}
