//! Unified sleep.raw_record.v1 schema
//!
//! This module defines the input schema for heart-rate and stage-label
//! telemetry and the adapter that turns it into typed, ordered streams.

mod adapter;
mod raw_record;

pub use adapter::*;
pub use raw_record::*;
