//! System utilities
//!
//! Accelerator detection for device descriptors.

pub mod gpu;
