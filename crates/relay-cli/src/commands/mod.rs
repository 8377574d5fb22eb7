//! Command implementations

pub mod batch;
pub mod capabilities;
pub mod exec;
pub mod status;
