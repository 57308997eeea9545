//! Calibration range table and affine / fixed-point parameter derivation.
//!
//! The [`Quantizer`] owns the per-connector ranges recorded by calibration
//! and provides the arithmetic the lowering transforms build on:
//! range folding and normalization, asymmetric affine parameters, and
//! integer `(mantissa, shift)` approximations of real rescale ratios.

use std::collections::HashMap;

use nnq_ir::{FixedMul, OutputId, QuantParam, ValueRange};

/// Narrowest range width [`Quantizer::fixup_range`] lets through.
pub const MIN_RANGE_WIDTH: f32 = 0.01;

/// Width given to a zero-width range.
pub const DEGENERATE_RANGE_WIDTH: f32 = 0.1;

/// Errors raised while deriving quantization parameters.
#[derive(Debug, thiserror::Error)]
pub enum QuantizeError {
    /// A range was requested over no values.
    #[error("cannot compute the range of an empty tensor")]
    EmptyRange,
    /// A range has non-finite bounds and cannot be normalized.
    #[error("range {0} cannot be normalized: bounds must be finite")]
    InvalidRange(ValueRange),
    /// The requested bit width is not supported.
    #[error("unsupported quantization bit width {0} (expected 1..=16)")]
    UnsupportedBits(u32),
    /// A connector that must be quantized has no recorded range.
    #[error("missing calibration data for connector {connector}")]
    MissingCalibration { connector: OutputId },
    /// No fixed-point multiplier within the bit budget represents the ratio.
    #[error(
        "ratio {ratio} is not representable with {max_bits} bits and mantissa <= {max_value}"
    )]
    UnrepresentableRatio {
        ratio: f32,
        max_bits: i32,
        max_value: i64,
    },
    /// The multiplier needs a non-positive shift, which integer-only rescale cannot apply.
    #[error("rescale ratio {ratio} needs shift {shift} (mantissa {mantissa}); a positive shift is required")]
    NonPositiveShift {
        ratio: f32,
        mantissa: i32,
        shift: i32,
    },
    /// A requantized bias value does not fit in 32 bits.
    #[error("bias {value} overflows i32 at accumulator scale {scale}")]
    BiasOverflow { value: f32, scale: f32 },
}

/// Per-connector calibration ranges plus quantization arithmetic.
#[derive(Clone, Debug, Default)]
pub struct Quantizer {
    ranges: HashMap<OutputId, ValueRange>,
}

impl Quantizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sequence of values into its `{min, max}`.
    pub fn get_range<I>(&self, values: I) -> Result<ValueRange, QuantizeError>
    where
        I: IntoIterator<Item = f32>,
    {
        let mut iter = values.into_iter();
        let first = iter.next().ok_or(QuantizeError::EmptyRange)?;
        Ok(iter.fold(ValueRange::new(first, first), |r, v| ValueRange {
            min: r.min.min(v),
            max: r.max.max(v),
        }))
    }

    /// Normalize a range so it includes zero and has a usable width.
    ///
    /// A range entirely on one side of zero is extended to zero. A width
    /// below [`MIN_RANGE_WIDTH`] is widened upward (a zero width becomes
    /// [`DEGENERATE_RANGE_WIDTH`]).
    pub fn fixup_range(&self, range: ValueRange) -> Result<ValueRange, QuantizeError> {
        if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
            return Err(QuantizeError::InvalidRange(range));
        }

        let mut r = ValueRange {
            min: range.min.min(0.0),
            max: range.max.max(0.0),
        };
        let width = r.width();
        if width == 0.0 {
            r.max = r.min + DEGENERATE_RANGE_WIDTH;
        } else if width < MIN_RANGE_WIDTH {
            r.max = r.min + MIN_RANGE_WIDTH;
        }
        // Widening can only move max up, so zero stays inside.
        Ok(r)
    }

    /// Asymmetric affine parameters mapping `range` onto `[0, 2^bits - 1]`.
    ///
    /// The range is normalized with [`fixup_range`](Self::fixup_range) first,
    /// so the returned scale is always positive.
    pub fn get_quant_param(
        &self,
        range: ValueRange,
        bits: u32,
    ) -> Result<QuantParam, QuantizeError> {
        if !(1..=16).contains(&bits) {
            return Err(QuantizeError::UnsupportedBits(bits));
        }
        let range = self.fixup_range(range)?;
        let q_max = ((1u32 << bits) - 1) as f32;
        let scale = range.width() / q_max;
        // -min / scale, without the extra rounding of the stored step.
        let zero_point = (-range.min * q_max / range.width())
            .round()
            .clamp(0.0, q_max) as i32;
        Ok(QuantParam { scale, zero_point })
    }

    /// The recorded range of the tensor produced by `connector`.
    pub fn get(&self, connector: OutputId) -> Result<ValueRange, QuantizeError> {
        self.ranges
            .get(&connector)
            .copied()
            .ok_or(QuantizeError::MissingCalibration { connector })
    }

    /// Approximate `ratio` as `mantissa / 2^shift`.
    ///
    /// Picks the largest `shift` in `[-max_bits, max_bits]` for which
    /// `mantissa = round(ratio * 2^shift)` stays within `max_value` and fits
    /// in `max_bits` (one bit fewer when signed). The result satisfies
    /// `|mantissa / 2^shift - ratio| <= 2^-(shift + 1)`.
    pub fn get_fixed_mul(
        &self,
        ratio: f32,
        max_bits: i32,
        max_value: i64,
        is_signed: bool,
    ) -> Result<FixedMul, QuantizeError> {
        let unrepresentable = QuantizeError::UnrepresentableRatio {
            ratio,
            max_bits,
            max_value,
        };
        if !ratio.is_finite() || ratio <= 0.0 || !(1..=32).contains(&max_bits) {
            return Err(unrepresentable);
        }

        let value_bits = if is_signed { max_bits - 1 } else { max_bits };
        let limit = max_value
            .min((1i64 << value_bits) - 1)
            .min(i64::from(i32::MAX));
        if limit < 1 {
            return Err(unrepresentable);
        }

        let ratio_f64 = f64::from(ratio);
        for shift in (-max_bits..=max_bits).rev() {
            let mantissa = (ratio_f64 * 2f64.powi(shift)).round();
            if mantissa > limit as f64 {
                continue;
            }
            if mantissa < 1.0 {
                // Too small to distinguish from zero even at the largest shift.
                return Err(unrepresentable);
            }
            return Ok(FixedMul {
                mantissa: mantissa as i32,
                shift,
            });
        }
        Err(unrepresentable)
    }

    /// Record the range of the tensor produced by `connector`, replacing any
    /// previous entry.
    pub fn set_range(&mut self, connector: OutputId, range: ValueRange) {
        self.ranges.insert(connector, range);
    }

    /// Fold observed values into the range recorded for `connector`.
    pub fn record<I>(&mut self, connector: OutputId, values: I) -> Result<(), QuantizeError>
    where
        I: IntoIterator<Item = f32>,
    {
        let observed = self.get_range(values)?;
        let merged = match self.ranges.get(&connector) {
            Some(existing) => existing.union(&observed),
            None => observed,
        };
        self.ranges.insert(connector, merged);
        Ok(())
    }

    /// Make `new` inherit the range recorded for `old`.
    pub fn link(&mut self, old: OutputId, new: OutputId) -> Result<(), QuantizeError> {
        let range = self.get(old)?;
        self.ranges.insert(new, range);
        Ok(())
    }

    /// Returns `true` if a range is recorded for `connector`.
    pub fn contains(&self, connector: OutputId) -> bool {
        self.ranges.contains_key(&connector)
    }

    /// Number of recorded ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates over recorded `(connector, range)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (OutputId, ValueRange)> + '_ {
        self.ranges.iter().map(|(&c, &r)| (c, r))
    }
}
