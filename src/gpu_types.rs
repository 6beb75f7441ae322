//! Typed views over device buffers.
//!
//! Kernels take raw device pointers; these views carry the shape and element type
//! alongside the borrow so mismatches are caught at the API boundary.

use crate::backend_trait::{DeviceBuffer, Precondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDtype {
    I8,
    I32,
    F16,
    F32,
}

impl TensorDtype {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            TensorDtype::I8 => 1,
            TensorDtype::F16 => 2,
            TensorDtype::I32 | TensorDtype::F32 => 4,
        }
    }

    /// Byte size of `len` elements.
    pub fn byte_len(self, len: usize) -> Result<usize, Precondition> {
        len.checked_mul(self.size_in_bytes())
            .ok_or(Precondition::Overflow { name: "bytes", value: len })
    }

    pub const fn is_float(self) -> bool {
        matches!(self, TensorDtype::F16 | TensorDtype::F32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            TensorDtype::I8 => "i8",
            TensorDtype::I32 => "i32",
            TensorDtype::F16 => "f16",
            TensorDtype::F32 => "f32",
        }
    }
}

/// (batch, rows, cols), row-major within a batch slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixShape {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    pub const fn new(batch: usize, rows: usize, cols: usize) -> Self {
        Self { batch, rows, cols }
    }

    /// Total element count with overflow check.
    pub fn numel(&self) -> Result<usize, Precondition> {
        self.batch
            .checked_mul(self.rows)
            .and_then(|v| v.checked_mul(self.cols))
            .ok_or(Precondition::Overflow {
                name: "numel",
                value: usize::MAX,
            })
    }

}

fn check_len<M: DeviceBuffer>(
    name: &'static str,
    buffer: &M,
    expected: usize,
) -> Result<(), Precondition> {
    if buffer.len() < expected {
        return Err(Precondition::BufferTooSmall {
            name,
            actual: buffer.len(),
            expected,
        });
    }
    Ok(())
}

fn check_scale_dtype<M: DeviceBuffer>(buffer: &M) -> Result<(), Precondition> {
    if buffer.dtype() != TensorDtype::F32 {
        return Err(Precondition::DtypeMismatch {
            name: "scale",
            actual: buffer.dtype(),
            expected: "f32",
        });
    }
    Ok(())
}

/// Borrowed (batch, rows, cols) matrix.
#[derive(Debug)]
pub struct MatrixRef<'a, M> {
    buffer: &'a M,
    shape: MatrixShape,
}

impl<M> Clone for MatrixRef<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for MatrixRef<'_, M> {}

impl<'a, M: DeviceBuffer> MatrixRef<'a, M> {
    pub fn new(buffer: &'a M, batch: usize, rows: usize, cols: usize) -> Result<Self, Precondition> {
        Self::with_shape(buffer, MatrixShape::new(batch, rows, cols))
    }

    pub fn with_shape(buffer: &'a M, shape: MatrixShape) -> Result<Self, Precondition> {
        check_len("matrix", buffer, shape.numel()?)?;
        Ok(Self { buffer, shape })
    }

    pub fn buffer(&self) -> &'a M {
        self.buffer
    }

    pub fn shape(&self) -> MatrixShape {
        self.shape
    }

    pub fn dtype(&self) -> TensorDtype {
        self.buffer.dtype()
    }
}

/// Mutably borrowed (batch, rows, cols) matrix, written by a kernel.
#[derive(Debug)]
pub struct MatrixMut<'a, M> {
    buffer: &'a mut M,
    shape: MatrixShape,
}

impl<'a, M: DeviceBuffer> MatrixMut<'a, M> {
    pub fn new(
        buffer: &'a mut M,
        batch: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Self, Precondition> {
        Self::with_shape(buffer, MatrixShape::new(batch, rows, cols))
    }

    pub fn with_shape(buffer: &'a mut M, shape: MatrixShape) -> Result<Self, Precondition> {
        check_len("output", buffer, shape.numel()?)?;
        Ok(Self { buffer, shape })
    }

    pub fn shape(&self) -> MatrixShape {
        self.shape
    }

    pub fn dtype(&self) -> TensorDtype {
        self.buffer.dtype()
    }

    pub fn into_buffer(self) -> &'a mut M {
        self.buffer
    }
}

/// Borrowed (batch, len) f32 scale vector.
#[derive(Debug)]
pub struct ScaleRef<'a, M> {
    buffer: &'a M,
    batch: usize,
    len: usize,
}

impl<M> Clone for ScaleRef<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for ScaleRef<'_, M> {}

impl<'a, M: DeviceBuffer> ScaleRef<'a, M> {
    pub fn new(buffer: &'a M, batch: usize, len: usize) -> Result<Self, Precondition> {
        check_scale_dtype(buffer)?;
        check_len("scale", buffer, MatrixShape::new(batch, 1, len).numel()?)?;
        Ok(Self { buffer, batch, len })
    }

    pub fn buffer(&self) -> &'a M {
        self.buffer
    }

    /// (batch, len)
    pub fn shape(&self) -> (usize, usize) {
        (self.batch, self.len)
    }
}

/// Mutably borrowed (batch, len) f32 scale vector.
#[derive(Debug)]
pub struct ScaleMut<'a, M> {
    buffer: &'a mut M,
    batch: usize,
    len: usize,
}

impl<'a, M: DeviceBuffer> ScaleMut<'a, M> {
    pub fn new(buffer: &'a mut M, batch: usize, len: usize) -> Result<Self, Precondition> {
        check_scale_dtype(buffer)?;
        check_len("scale", buffer, MatrixShape::new(batch, 1, len).numel()?)?;
        Ok(Self { buffer, batch, len })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.batch, self.len)
    }

    pub fn into_buffer(self) -> &'a mut M {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::HostBuffer;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(TensorDtype::I8.size_in_bytes(), 1);
        assert_eq!(TensorDtype::F16.size_in_bytes(), 2);
        assert_eq!(TensorDtype::I32.size_in_bytes(), 4);
        assert!(TensorDtype::F16.is_float());
        assert!(!TensorDtype::I32.is_float());
    }

    #[test]
    fn test_byte_len_checks_overflow() {
        assert_eq!(TensorDtype::F16.byte_len(10), Ok(20));
        assert_eq!(TensorDtype::I8.byte_len(usize::MAX), Ok(usize::MAX));
        assert_eq!(
            TensorDtype::F32.byte_len(usize::MAX / 2),
            Err(Precondition::Overflow { name: "bytes", value: usize::MAX / 2 })
        );
    }

    #[test]
    fn test_matrix_ref_checks_length() {
        let buf = HostBuffer::zeros(TensorDtype::F32, 8);
        assert!(MatrixRef::new(&buf, 1, 2, 4).is_ok());
        assert_eq!(
            MatrixRef::new(&buf, 2, 2, 4).unwrap_err(),
            Precondition::BufferTooSmall {
                name: "matrix",
                actual: 8,
                expected: 16
            }
        );
    }

    #[test]
    fn test_scale_requires_f32() {
        let buf = HostBuffer::zeros(TensorDtype::F16, 4);
        assert!(matches!(
            ScaleRef::new(&buf, 1, 4),
            Err(Precondition::DtypeMismatch { name: "scale", .. })
        ));
    }

    #[test]
    fn test_numel_overflow() {
        assert!(MatrixShape::new(usize::MAX, 2, 2).numel().is_err());
    }
}
