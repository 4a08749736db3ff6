//! StripeStore Common - Shared types and utilities
//!
//! This crate provides the error type, checksum providers, striping policy
//! and configuration types used by the storage engine and the OSD daemon.

pub mod checksum;
pub mod config;
pub mod error;
pub mod striping;
pub mod types;

pub use checksum::{ChecksumAlgorithm, ChecksumProvider, checksum_provider};
pub use config::OsdConfig;
pub use error::{Error, Result};
pub use striping::StripingPolicy;
pub use types::*;
