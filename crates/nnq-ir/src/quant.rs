//! Quantization parameter types shared by the transforms and the runtime.

/// An observed or derived real-valued range `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Width of the range.
    pub fn width(&self) -> f32 {
        self.max - self.min
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &ValueRange) -> ValueRange {
        ValueRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Returns `true` if the range is finite, includes zero and has a
    /// nonzero width, i.e. it can be mapped by an affine quantizer.
    pub fn is_normalized(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min <= 0.0
            && self.max >= 0.0
            && self.max > self.min
    }
}

/// Affine quantization parameters.
///
/// `scale` is the real-valued width of one quantization step:
/// `q = clamp(round(v / scale + zero_point))` and
/// `v ≈ (q - zero_point) * scale`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParam {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParam {
    /// Quantize a real value to an unsigned 8-bit code.
    ///
    /// The zero point is added before rounding (half away from zero), then
    /// the code is clamped to `[0, 255]`.
    pub fn quantize_u8(&self, value: f32) -> u8 {
        let q = (value / self.scale + self.zero_point as f32).round();
        q.clamp(0.0, 255.0) as u8
    }

    /// Map a quantized code back to its real value.
    pub fn dequantize(&self, code: i32) -> f32 {
        (code - self.zero_point) as f32 * self.scale
    }
}

/// Integer approximation of a positive ratio: `ratio ≈ mantissa / 2^shift`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedMul {
    pub mantissa: i32,
    pub shift: i32,
}

impl FixedMul {
    /// The ratio this multiplier represents.
    pub fn value(&self) -> f64 {
        f64::from(self.mantissa) * 2f64.powi(-self.shift)
    }
}
