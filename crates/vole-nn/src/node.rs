// Node trait — The interface every graph layer implements
//
// A network is a graph of named nodes. The graph owns the wiring and the
// output tensors; a node owns its hyper-parameters, its parameter tensors
// and whatever it must remember between forward and backward (dropout mask,
// last loss value).
//
// WHY A TRAIT OBJECT?
//
// Graphs are assembled at runtime, loaded from archives, and cloned into
// reference networks, so the set of node types in a graph is only known at
// runtime. `Box<dyn Node>` plus `as_any` downcasting gives typed access
// (`network.layer_as::<SinkNode>("out")`) without a closed enum.
//
// PARAMETER SHARING:
//
// `share()` builds the copy a reference network uses: same name and
// hyper-parameters, parameters aliased through `Tensor::share()` (Borrowed,
// read-only), no gradients, no cached state. A reference therefore reads its
// original's weights and can never write them.

use std::any::Any;
use std::io::{Read, Write};

use vole_core::{ArchiveReader, ArchiveWriter, Error, MathEngine, Random, Result, Tensor};

use crate::activation::ActivationNode;
use crate::dropout::DropoutNode;
use crate::linear::FullyConnectedNode;
use crate::loss::EuclideanLossNode;
use crate::sink::SinkNode;
use crate::source::SourceNode;

/// Archive writer handed to [`Node::save`].
pub type NodeWriter<'a> = ArchiveWriter<&'a mut dyn Write>;

/// Archive reader handed to [`load_node`].
pub type NodeReader<'a> = ArchiveReader<&'a mut dyn Read>;

/// Concrete node type, used as the archive tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Source,
    FullyConnected,
    Activation,
    Dropout,
    EuclideanLoss,
    Sink,
}

impl NodeKind {
    pub fn tag(self) -> u8 {
        match self {
            NodeKind::Source => 1,
            NodeKind::FullyConnected => 2,
            NodeKind::Activation => 3,
            NodeKind::Dropout => 4,
            NodeKind::EuclideanLoss => 5,
            NodeKind::Sink => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => NodeKind::Source,
            2 => NodeKind::FullyConnected,
            3 => NodeKind::Activation,
            4 => NodeKind::Dropout,
            5 => NodeKind::EuclideanLoss,
            6 => NodeKind::Sink,
            _ => return Err(Error::archive(format!("unknown node kind tag {tag}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::FullyConnected => "fully_connected",
            NodeKind::Activation => "activation",
            NodeKind::Dropout => "dropout",
            NodeKind::EuclideanLoss => "euclidean_loss",
            NodeKind::Sink => "sink",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a node may use while running, besides its inputs.
pub struct RunContext<'a> {
    /// Compute engine shared by the whole network family.
    pub engine: &'a dyn MathEngine,
    /// The running network's own random stream.
    pub random: &'a mut Random,
    /// Whether the network is in learning mode (enables dropout masks).
    pub learning: bool,
}

/// A layer of the computation graph.
///
/// # Gradients
///
/// `backward` receives one optional gradient per output (`None` when no
/// gradient reaches that output) and returns one optional gradient per
/// input. Trainable nodes also store their parameter gradients, readable
/// through [`Node::parameter_grads`]; when no gradient reaches them, those
/// become `None`, so a solver never applies a stale step.
pub trait Node: Send + Any {
    /// Unique name within its graph.
    fn name(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Number of input connections this node requires.
    fn input_count(&self) -> usize;

    /// Number of output tensors this node produces.
    fn output_count(&self) -> usize;

    /// Compute outputs from inputs.
    fn forward(&mut self, inputs: &[Tensor], ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>>;

    /// Propagate gradients from outputs to inputs.
    fn backward(
        &mut self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        output_diffs: &[Option<Tensor>],
        ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>>;

    /// Parameter tensors, in a stable order.
    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }

    /// Gradients from the last backward pass, aligned with `parameters()`.
    fn parameter_grads(&self) -> Vec<Option<Tensor>> {
        Vec::new()
    }

    fn is_trainable(&self) -> bool {
        !self.parameters().is_empty()
    }

    /// Whether forward output depends on the random stream while learning.
    fn is_stochastic(&self) -> bool {
        false
    }

    /// Copy for a reference network (see module docs).
    fn share(&self) -> Box<dyn Node>;

    /// Write the node-specific archive body (hyper-parameters, parameters).
    fn save(&self, writer: &mut NodeWriter<'_>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Rebuild a node of `kind` from the body written by [`Node::save`].
pub fn load_node(kind: NodeKind, name: &str, reader: &mut NodeReader<'_>) -> Result<Box<dyn Node>> {
    log::trace!("loading {kind} layer '{name}'");
    Ok(match kind {
        NodeKind::Source => Box::new(SourceNode::load(name, reader)?),
        NodeKind::FullyConnected => Box::new(FullyConnectedNode::load(name, reader)?),
        NodeKind::Activation => Box::new(ActivationNode::load(name, reader)?),
        NodeKind::Dropout => Box::new(DropoutNode::load(name, reader)?),
        NodeKind::EuclideanLoss => Box::new(EuclideanLossNode::load(name, reader)?),
        NodeKind::Sink => Box::new(SinkNode::load(name, reader)?),
    })
}

/// Check the number of tensors handed to a node.
pub(crate) fn expect_inputs(name: &str, inputs: &[Tensor], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(Error::InputCountMismatch {
            layer: name.to_string(),
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [
            NodeKind::Source,
            NodeKind::FullyConnected,
            NodeKind::Activation,
            NodeKind::Dropout,
            NodeKind::EuclideanLoss,
            NodeKind::Sink,
        ] {
            assert_eq!(NodeKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(NodeKind::from_tag(0).is_err());
        assert!(NodeKind::from_tag(99).is_err());
    }

    #[test]
    fn test_boxed_nodes_downcast() {
        let node: Box<dyn Node> = Box::new(SinkNode::new("out"));
        assert!(node.as_any().downcast_ref::<SinkNode>().is_some());
        assert!(node.as_any().downcast_ref::<SourceNode>().is_none());
        assert_eq!(node.kind().to_string(), "sink");
    }
}
