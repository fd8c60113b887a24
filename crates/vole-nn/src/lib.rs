//! # vole-nn
//!
//! Graph layers for vole.
//!
//! Every layer implements the [`Node`] trait and is stored in a network's
//! graph as a `Box<dyn Node>`:
//!
//! 1. **SourceNode** — feeds an input tensor into the graph
//! 2. **FullyConnectedNode** — dense layer: `y = xW^T + b`
//! 3. **ActivationNode** — ReLU, Sigmoid, Tanh
//! 4. **DropoutNode** — regularization while learning
//! 5. **EuclideanLossNode** — mean squared error, origin of backward passes
//! 6. **SinkNode** — captures a result tensor
//!
//! Nodes compute through a [`vole_core::MathEngine`] handed to them in a
//! [`RunContext`], and know how to [`share`](Node::share) their parameters
//! with a reference network and how to save and [`load_node`] themselves.

pub mod activation;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod loss;
pub mod node;
pub mod sink;
pub mod source;

pub use activation::ActivationNode;
pub use dropout::DropoutNode;
pub use linear::FullyConnectedNode;
pub use loss::EuclideanLossNode;
pub use node::{load_node, Node, NodeKind, NodeReader, NodeWriter, RunContext};
pub use sink::SinkNode;
pub use source::SourceNode;
