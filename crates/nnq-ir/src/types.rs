//! Tensor types and attribute flags for the graph IR.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
}

/// Dense NCHW tensor shape.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    /// Creates a shape from its dimensions.
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for a rank-0 shape).
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims)
    }
}

/// The type carried by a connector.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TensorType {
    pub scalar: Scalar,
    pub shape: Shape,
}

impl TensorType {
    pub fn new(scalar: Scalar, shape: impl Into<Shape>) -> Self {
        Self {
            scalar,
            shape: shape.into(),
        }
    }

    /// An `f32` tensor of the given shape.
    pub fn f32(shape: impl Into<Shape>) -> Self {
        Self::new(Scalar::F32, shape)
    }

    /// A `u8` tensor of the given shape.
    pub fn u8(shape: impl Into<Shape>) -> Self {
        Self::new(Scalar::U8, shape)
    }

    /// Same shape, different element type.
    pub fn with_scalar(&self, scalar: Scalar) -> Self {
        Self {
            scalar,
            shape: self.shape.clone(),
        }
    }
}

/// Attribute flags attached to nodes and connectors.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct Attributes(u32);

impl Attributes {
    /// No flags.
    pub const EMPTY: Self = Self(0);
    /// The tensor belongs to a quantized region and must carry calibration data.
    pub const NEEDS_QUANTIZE: Self = Self(1);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets all flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears all flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Attributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Attributes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Spatial padding on one axis. Negative values crop.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct Padding {
    pub before: i32,
    pub after: i32,
}

impl Padding {
    pub const ZERO: Self = Self {
        before: 0,
        after: 0,
    };

    pub fn new(before: i32, after: i32) -> Self {
        Self { before, after }
    }

    /// Symmetric padding.
    pub fn same(pad: i32) -> Self {
        Self::new(pad, pad)
    }

    pub fn sum(self) -> i64 {
        i64::from(self.before) + i64::from(self.after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_constants() {
        assert_eq!(Scalar::F32.kind, ScalarKind::Float);
        assert_eq!(Scalar::F32.width, 4);
        assert_eq!(Scalar::U8.kind, ScalarKind::Uint);
        assert_eq!(Scalar::U8.width, 1);
        assert_eq!(Scalar::I32.kind, ScalarKind::Sint);
    }

    #[test]
    fn shape_elements() {
        let shape = Shape::from([1, 3, 4, 4]);
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.num_elements(), 48);
        assert_eq!(Shape::default().num_elements(), 1);
    }

    #[test]
    fn attributes_flags() {
        let mut attrs = Attributes::EMPTY;
        assert!(attrs.is_empty());
        attrs |= Attributes::NEEDS_QUANTIZE;
        assert!(attrs.contains(Attributes::NEEDS_QUANTIZE));
        attrs.remove(Attributes::NEEDS_QUANTIZE);
        assert!(attrs.is_empty());
        assert!(attrs.contains(Attributes::EMPTY));
    }

    #[test]
    fn tensor_type_with_scalar() {
        let ty = TensorType::f32([1, 8]);
        let q = ty.with_scalar(Scalar::U8);
        assert_eq!(q, TensorType::u8([1, 8]));
    }
}
