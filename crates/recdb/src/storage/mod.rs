//! Array storage - raw sample buffers for one array slot of a recording.
//!
//! Buffers are contiguous, row-major (C order) and backed by 8-byte words so
//! every [`ElementType`] can be viewed in place without copying:
//!
//! ```text
//! shape [rows, cols] ─► element strides [cols, 1]
//! words: Vec<u64>     ─► bytes: &[u8] (nbytes) ─► &[T] (element_count)
//! ```
//!
//! Storage is owned exclusively by the [`Recording`](crate::Recording) that
//! allocated it. Once the recording reaches `DataReady`, the storage is moved
//! into the recording's frozen array set and can no longer be borrowed mutably.

use crate::error::{RecDbError, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Fixed enumeration of element types an array may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    UInt64,
    /// IEEE 754 half precision float (raw bits only).
    Float16,
    /// IEEE 754 single precision float.
    Float32,
    /// IEEE 754 double precision float.
    Float64,
    /// Packed 8-bit red/green/blue/alpha pixel.
    Rgba32,
}

impl ElementType {
    /// Size of a single element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 | ElementType::Float16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Rgba32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }

    /// Canonical lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Int8 => "int8",
            ElementType::UInt8 => "uint8",
            ElementType::Int16 => "int16",
            ElementType::UInt16 => "uint16",
            ElementType::Int32 => "int32",
            ElementType::UInt32 => "uint32",
            ElementType::Int64 => "int64",
            ElementType::UInt64 => "uint64",
            ElementType::Float16 => "float16",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Rgba32 => "rgba32",
        }
    }

    /// Returns true for floating point types.
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            ElementType::Float16 | ElementType::Float32 | ElementType::Float64
        )
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native Rust types that map exactly onto an [`ElementType`].
///
/// Typed access checks the tag and never casts silently. `Float16` has no
/// native implementation and is reached through the raw byte views.
pub trait Element: Pod {
    /// Element type tag for this native type.
    const ELEMENT_TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$tag;
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// Packed RGBA pixel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Rgba32 {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel.
    pub a: u8,
}

impl Rgba32 {
    /// Creates a pixel from its channels.
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl Element for Rgba32 {
    const ELEMENT_TYPE: ElementType = ElementType::Rgba32;
}

/// Shape and row-major element strides of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLayout {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl ArrayLayout {
    /// Creates a row-major layout for `shape`.
    ///
    /// An empty shape is a scalar holding one element.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` if any dimension is zero or the element
    /// count overflows `usize`.
    pub fn new(shape: &[usize]) -> Result<Self> {
        if let Some(axis) = shape.iter().position(|&dim| dim == 0) {
            return Err(RecDbError::SizeError(format!(
                "zero-length dimension at axis {axis} in shape {shape:?}"
            )));
        }

        let mut strides = vec![0; shape.len()];
        let mut stride: usize = 1;
        for axis in (0..shape.len()).rev() {
            strides[axis] = stride;
            stride = stride.checked_mul(shape[axis]).ok_or_else(|| {
                RecDbError::SizeError(format!("element count overflow for shape {shape:?}"))
            })?;
        }

        Ok(Self {
            shape: shape.to_vec(),
            strides,
        })
    }

    /// Dimensions of the array.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element strides per axis.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Linear element offset of a multi-dimensional index.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` if the index rank or any coordinate is
    /// out of bounds.
    pub fn offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(RecDbError::SizeError(format!(
                "index {index:?} has rank {}, array has rank {}",
                index.len(),
                self.shape.len()
            )));
        }
        let mut offset = 0;
        for (axis, (&i, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if i >= dim {
                return Err(RecDbError::SizeError(format!(
                    "index {i} out of bounds for axis {axis} with length {dim}"
                )));
            }
            offset += i * self.strides[axis];
        }
        Ok(offset)
    }
}

/// Raw sample buffer of one array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayStorage {
    element_type: ElementType,
    layout: ArrayLayout,
    words: Vec<u64>,
    nbytes: usize,
}

impl ArrayStorage {
    /// Allocates a zero-filled buffer.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` if the shape is invalid or the byte
    /// size overflows.
    pub fn allocate(element_type: ElementType, shape: &[usize]) -> Result<Self> {
        let layout = ArrayLayout::new(shape)?;
        let nbytes = layout
            .element_count()
            .checked_mul(element_type.size())
            .ok_or_else(|| {
                RecDbError::SizeError(format!("byte size overflow for shape {shape:?}"))
            })?;
        let words = vec![0u64; nbytes.div_ceil(8)];

        Ok(Self {
            element_type,
            layout,
            words,
            nbytes,
        })
    }

    /// Allocates a buffer and copies `values` into it.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` if `values` does not hold exactly one
    /// element per position of `shape`.
    pub fn from_slice<T: Element>(shape: &[usize], values: &[T]) -> Result<Self> {
        let mut storage = Self::allocate(T::ELEMENT_TYPE, shape)?;
        storage.copy_from_slice(values)?;
        Ok(storage)
    }

    /// Element type of the buffer.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Layout of the buffer.
    pub fn layout(&self) -> &ArrayLayout {
        &self.layout
    }

    /// Dimensions of the buffer.
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.layout.element_count()
    }

    /// Always false: zero-length dimensions are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the buffer in bytes.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.nbytes]
    }

    /// Mutable raw byte view.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..nbytes]
    }

    /// Typed element view.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::TypeMismatch` if `T` is not the declared type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Mutable typed element view.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::TypeMismatch` if `T` is not the declared type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    /// Reads the element at a multi-dimensional index.
    pub fn get<T: Element>(&self, index: &[usize]) -> Result<T> {
        let offset = self.layout.offset(index)?;
        Ok(self.as_slice::<T>()?[offset])
    }

    /// Writes the element at a multi-dimensional index.
    pub fn set<T: Element>(&mut self, index: &[usize], value: T) -> Result<()> {
        let offset = self.layout.offset(index)?;
        self.as_mut_slice::<T>()?[offset] = value;
        Ok(())
    }

    /// Copies `values` over the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::TypeMismatch` on a type mismatch and
    /// `RecDbError::SizeError` if the lengths differ.
    pub fn copy_from_slice<T: Element>(&mut self, values: &[T]) -> Result<()> {
        let len = self.len();
        let target = self.as_mut_slice::<T>()?;
        if values.len() != len {
            return Err(RecDbError::SizeError(format!(
                "expected {len} elements, got {}",
                values.len()
            )));
        }
        target.copy_from_slice(values);
        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill<T: Element>(&mut self, value: T) -> Result<()> {
        self.as_mut_slice::<T>()?.fill(value);
        Ok(())
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(RecDbError::TypeMismatch {
                expected: self.element_type,
                actual: T::ELEMENT_TYPE,
            });
        }
        Ok(())
    }
}
