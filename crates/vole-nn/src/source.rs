// SourceNode — feeds a user-supplied tensor into the graph
//
// The blob is set from outside (`Network::set_input`) and emitted unchanged
// on the single output. A shared copy starts without a blob: each reference
// network gets its own inputs.

use std::any::Any;

use vole_core::{Error, Result, Tensor};

use crate::node::{Node, NodeKind, NodeReader, NodeWriter, RunContext};

/// Graph entry point holding one input tensor.
pub struct SourceNode {
    name: String,
    blob: Option<Tensor>,
}

impl SourceNode {
    pub fn new(name: impl Into<String>) -> Self {
        SourceNode {
            name: name.into(),
            blob: None,
        }
    }

    /// Replace the tensor emitted by this node.
    pub fn set_blob(&mut self, blob: Tensor) {
        self.blob = Some(blob);
    }

    pub fn blob(&self) -> Option<&Tensor> {
        self.blob.as_ref()
    }

    pub(crate) fn load(name: &str, _reader: &mut NodeReader<'_>) -> Result<Self> {
        Ok(SourceNode::new(name))
    }
}

impl Node for SourceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn input_count(&self) -> usize {
        0
    }

    fn output_count(&self) -> usize {
        1
    }

    fn forward(&mut self, _inputs: &[Tensor], _ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        match &self.blob {
            Some(blob) => Ok(vec![blob.clone()]),
            None => Err(Error::MissingBlob {
                name: self.name.clone(),
            }),
        }
    }

    fn backward(
        &mut self,
        _inputs: &[Tensor],
        _outputs: &[Tensor],
        _output_diffs: &[Option<Tensor>],
        _ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        Ok(Vec::new())
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(SourceNode::new(self.name.clone()))
    }

    // Blobs are run-time data, not part of the model.
    fn save(&self, _writer: &mut NodeWriter<'_>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{CpuEngine, Random};

    #[test]
    fn test_forward_without_blob_fails() {
        let engine = CpuEngine::new();
        let mut rng = Random::new(0);
        let mut ctx = RunContext {
            engine: &engine,
            random: &mut rng,
            learning: false,
        };
        let mut src = SourceNode::new("in");
        assert!(matches!(
            src.forward(&[], &mut ctx),
            Err(Error::MissingBlob { .. })
        ));

        let t = Tensor::from_vec(vec![1.0, 2.0], (1, 2)).unwrap();
        src.set_blob(t.clone());
        let out = src.forward(&[], &mut ctx).unwrap();
        assert!(out[0].shares_storage_with(&t));
    }

    #[test]
    fn test_shared_copy_has_no_blob() {
        let mut src = SourceNode::new("in");
        src.set_blob(Tensor::zeros((1, 3)));
        let shared = src.share();
        let shared = shared.as_any().downcast_ref::<SourceNode>().unwrap();
        assert!(shared.blob().is_none());
        assert_eq!(shared.name(), "in");
    }
}
