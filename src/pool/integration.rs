//! Cross-component tests: whole allocation paths through the facade, byte
//! conservation, list migration and the reference-count contract end to
//! end.
