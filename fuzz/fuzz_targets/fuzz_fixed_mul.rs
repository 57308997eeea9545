#![no_main]

use libfuzzer_sys::fuzz_target;
use nnq_opt::Quantizer;

fuzz_target!(|input: (f32, i32, i64, bool)| {
    let (ratio, max_bits, max_value, is_signed) = input;
    // Any ratio either yields a multiplier within the requested limits or an error.
    if let Ok(fm) = Quantizer::new().get_fixed_mul(ratio, max_bits, max_value, is_signed) {
        assert!(fm.mantissa >= 1);
        assert!(i64::from(fm.mantissa) <= max_value);
        assert!(fm.shift.abs() <= max_bits);
    }
});
