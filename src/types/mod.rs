//! Shared type definitions
//!
//! This module contains all shared data types used across the daemon.

pub mod config;
pub mod message;
pub mod model;
