//! # Vole
//!
//! A neural-network graph engine built around reference networks: cheap
//! copies of a trained network that share its parameters, so one set of
//! weights can serve many concurrent inference threads.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, Shape, MathEngine + CpuEngine, ThreadPool, probes, archive primitives |
//! | `vole-nn` | The `Node` trait and layers (Source, FullyConnected, Activation, Dropout, EuclideanLoss, Sink) |
//! | `vole` | Graph, Network, reference networks, solvers, checkpoints |
//!
//! ## Modules
//!
//! - [`network`] — Network: build, run, train, create references
//! - [`graph`] — validated layer DAG with incremental execution
//! - [`registry`] — learning mode shared by an original and its references
//! - [`solver`] — SimpleGradient (SGD with momentum) and Adam
//! - [`checkpoint`] — Save/load whole networks

pub use vole_core::{
    available_cpu_cores, ram_limit, BinaryOp, CpuEngine, CpuPerformanceCounters, DeviceType,
    Error, MathEngine, PerformanceCounter, PerformanceCounters, Provenance, Random, Result,
    Shape, Tensor, ThreadPool, UnaryOp,
};

/// Graph layers.
pub mod nn {
    pub use vole_nn::*;
}

pub mod checkpoint;
pub mod graph;
pub mod network;
pub mod registry;
pub mod solver;

/// Re-export the types most programs need.
pub mod prelude {
    pub use crate::graph::{Connection, Graph};
    pub use crate::network::{Network, NetworkConfig, NetworkKind};
    pub use crate::nn::{
        ActivationNode, DropoutNode, EuclideanLossNode, FullyConnectedNode, Node, NodeKind,
        SinkNode, SourceNode,
    };
    pub use crate::registry::{ReferenceLease, ReferenceRegistry};
    pub use crate::solver::{AdamSolver, SimpleGradientSolver, Solver, SolverKind};
    pub use crate::{
        available_cpu_cores, ram_limit, CpuEngine, DeviceType, Error, MathEngine,
        PerformanceCounters, Provenance, Random, Result, Shape, Tensor, ThreadPool, UnaryOp,
    };
}
