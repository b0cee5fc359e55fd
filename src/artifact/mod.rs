//! Boot artifact builders.
//!
//! - `uki` - Builds the per-generation Unified Kernel Image on the ESP

pub mod uki;

pub use uki::UkiBuilder;
