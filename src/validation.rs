//! Precondition checks for GEMM dispatch parameters.
//!
//! Everything here runs before the device is touched. Failures are returned as
//! [`Precondition`] values naming the violated constraint.

use crate::backend_trait::{DeviceBuffer, Precondition};
use crate::gpu_types::{MatrixShape, TensorDtype};

/// Validate that every named dimension is > 0.
#[inline]
pub fn validate_nonzero(dims: &[(&'static str, usize)]) -> Result<(), Precondition> {
    for &(name, value) in dims {
        if value == 0 {
            return Err(Precondition::ZeroDim { name });
        }
    }
    Ok(())
}

/// Validate `value % align == 0` for operands of `dtype`.
#[inline]
pub fn validate_alignment(
    name: &'static str,
    value: usize,
    align: usize,
    dtype: TensorDtype,
) -> Result<(), Precondition> {
    if value % align != 0 {
        return Err(Precondition::Misaligned {
            name,
            value,
            align,
            dtype,
        });
    }
    Ok(())
}

/// Batch counts must match, or one side must be 1 (broadcast).
#[inline]
pub fn validate_batch_pair(batch_a: usize, batch_b: usize) -> Result<(), Precondition> {
    if batch_a == batch_b || batch_a == 1 || batch_b == 1 {
        return Ok(());
    }
    Err(Precondition::BatchMismatch { batch_a, batch_b })
}

#[inline]
pub fn validate_float(name: &'static str, dtype: TensorDtype) -> Result<(), Precondition> {
    if !dtype.is_float() {
        return Err(Precondition::DtypeMismatch {
            name,
            actual: dtype,
            expected: "f16 or f32",
        });
    }
    Ok(())
}

#[inline]
pub fn validate_dtype(
    name: &'static str,
    actual: TensorDtype,
    expected: TensorDtype,
) -> Result<(), Precondition> {
    if actual != expected {
        return Err(Precondition::DtypeMismatch {
            name,
            actual,
            expected: expected.name(),
        });
    }
    Ok(())
}

/// Validate a (batch, len) scale against the expected (batch, len).
#[inline]
pub fn validate_scale_shape(
    name: &'static str,
    actual: (usize, usize),
    expected: (usize, usize),
) -> Result<(), Precondition> {
    validate_same_shape(
        name,
        MatrixShape::new(actual.0, 1, actual.1),
        MatrixShape::new(expected.0, 1, expected.1),
    )
}

#[inline]
pub fn validate_same_shape(
    name: &'static str,
    actual: MatrixShape,
    expected: MatrixShape,
) -> Result<(), Precondition> {
    if actual != expected {
        return Err(Precondition::ShapeMismatch {
            name,
            actual,
            expected,
        });
    }
    Ok(())
}

/// Validate a whole buffer against the dtype and shape it is used with.
#[inline]
pub fn validate_buffer<M: DeviceBuffer>(
    name: &'static str,
    buffer: &M,
    dtype: TensorDtype,
    shape: MatrixShape,
) -> Result<(), Precondition> {
    validate_dtype(name, buffer.dtype(), dtype)?;
    let expected = shape.numel()?;
    if buffer.len() < expected {
        return Err(Precondition::BufferTooSmall {
            name,
            actual: buffer.len(),
            expected,
        });
    }
    Ok(())
}

/// Convert usize to i32 for kernel and library parameters.
#[inline]
pub fn to_i32(value: usize, name: &'static str) -> Result<i32, Precondition> {
    i32::try_from(value).map_err(|_| Precondition::Overflow { name, value })
}

/// Convert usize to i64 for leading dimensions and batch strides.
#[inline]
pub fn to_i64(value: usize, name: &'static str) -> Result<i64, Precondition> {
    i64::try_from(value).map_err(|_| Precondition::Overflow { name, value })
}

/// Product of two dimensions with overflow check.
#[inline]
pub fn checked_area(rows: usize, cols: usize, name: &'static str) -> Result<usize, Precondition> {
    rows.checked_mul(cols)
        .ok_or(Precondition::Overflow { name, value: rows })
}

#[inline]
pub const fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
