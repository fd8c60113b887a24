//! # vole-core
//!
//! Core primitives for vole, a neural-network graph engine built around
//! cheap, concurrent inference copies of a trained network.
//!
//! This crate provides:
//! - [`Tensor`] — dense `f32` array whose handles carry a [`Provenance`]
//! - [`Shape`] — n-dimensional shape
//! - [`MathEngine`] trait — abstraction over the compute device, with
//!   [`CpuEngine`] as the reference implementation
//! - [`PerformanceCounters`] — time and memory between sync points
//! - [`ThreadPool`] — fixed workers with per-worker FIFO queues
//! - [`probe`] — container-aware core count and memory headroom
//! - [`archive`] — little-endian binary primitives for checkpoints
//! - [`Random`] — seeded random stream owned by each network

// - Shape / Tensor: data model, with Owned/Borrowed storage handles
// - MathEngine: every arithmetic operation nodes perform
// - ThreadPool + probe: the concurrency substrate for reference networks
// - archive: building blocks for network serialization

pub mod archive;
pub mod counters;
pub mod engine;
pub mod error;
pub mod memory;
pub mod probe;
pub mod random;
pub mod shape;
pub mod tensor;
pub mod thread_pool;

pub use archive::{ArchiveReader, ArchiveWriter};
pub use counters::{CpuPerformanceCounters, PerformanceCounter, PerformanceCounters};
pub use engine::{BinaryOp, CpuEngine, DeviceType, MathEngine, UnaryOp};
pub use error::{Error, Result};
pub use probe::{available_cpu_cores, ram_limit};
pub use random::Random;
pub use shape::Shape;
pub use tensor::{Provenance, Tensor};
pub use thread_pool::{Scope, Task, ThreadPool};
