use std::fmt;

/// Parameters shared by the fixed-point lowering transforms.
///
/// The bit width is fixed for a whole run; mixed precision is not supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantConfig {
    /// Bit width of quantized activations and weights.
    pub bits: u32,
    /// Bit budget searched by [`Quantizer::get_fixed_mul`](crate::Quantizer::get_fixed_mul).
    pub multiplier_bits: i32,
    /// Largest mantissa a rescale multiplier may use.
    pub multiplier_max: i64,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            bits: 8,
            multiplier_bits: 32,
            multiplier_max: 255,
        }
    }
}

impl fmt::Display for QuantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuantConfig {{ bits: {}, multiplier_bits: {}, multiplier_max: {} }}",
            self.bits, self.multiplier_bits, self.multiplier_max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_uint8() {
        let c = QuantConfig::default();
        assert_eq!(c.bits, 8);
        assert_eq!(c.multiplier_bits, 32);
        assert_eq!(c.multiplier_max, 255);
    }

    #[test]
    fn display() {
        assert_eq!(
            QuantConfig::default().to_string(),
            "QuantConfig { bits: 8, multiplier_bits: 32, multiplier_max: 255 }"
        );
    }
}
