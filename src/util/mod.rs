//! Shared helpers: filename handling and disk-space admission.

pub mod diskspace;
pub mod filename;
pub mod rate;
