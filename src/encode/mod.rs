//! On-disk encodings for intermediate (shuffle) data.

pub mod spill;

pub use spill::Spill;
