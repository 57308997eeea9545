//! End-to-end tests for the nnq quantization pipeline live in `tests/`.
