#![no_main]

use libfuzzer_sys::fuzz_target;
use nnq_ir::ValueRange;
use nnq_opt::Quantizer;

fuzz_target!(|input: (f32, f32, u32)| {
    let (min, max, bits) = input;
    let quantizer = Quantizer::new();
    if let Ok(range) = quantizer.fixup_range(ValueRange::new(min, max)) {
        assert!(range.is_normalized());
        let _ = quantizer.get_quant_param(range, bits);
    }
});
