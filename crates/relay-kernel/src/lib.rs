//! Relay Kernel
//!
//! Contracts shared by every part of the worker coordination engine:
//! domain tags, the newline-delimited JSON wire codec, the error taxonomy,
//! configuration, and the traits at the seams (worker launch, request
//! execution). Concrete pools, correlators and coordinators live in
//! `relay-foundation`; the kernel never depends on them.

// domain module
pub mod domain;
pub use domain::DomainType;

// wire module
pub mod wire;
pub use wire::{Command, ProtocolError, ResponseEnvelope};

// error module
pub mod error;
pub use error::{EngineError, EngineResult, KernelError, KernelResult};

// config module
pub mod config;

// launcher module
pub mod launcher;
pub use launcher::{WorkerChannel, WorkerLauncher, WorkerProcess};

// executor module
pub mod executor;
pub use executor::RequestExecutor;

// retry module
pub mod retry;
pub use retry::RetryPolicy;

// batch module
pub mod batch;

// metrics module
pub mod metrics;
