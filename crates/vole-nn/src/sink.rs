// SinkNode — captures a tensor at the end of the graph
//
// The sink keeps the handle it received on the last forward pass, which is
// how callers read results: `network.layer_as::<SinkNode>("out")?.blob()`.

use std::any::Any;

use vole_core::{Result, Tensor};

use crate::node::{expect_inputs, Node, NodeKind, NodeReader, NodeWriter, RunContext};

pub struct SinkNode {
    name: String,
    blob: Option<Tensor>,
}

impl SinkNode {
    pub fn new(name: impl Into<String>) -> Self {
        SinkNode {
            name: name.into(),
            blob: None,
        }
    }

    /// The tensor received on the last forward pass.
    pub fn blob(&self) -> Option<&Tensor> {
        self.blob.as_ref()
    }

    pub(crate) fn load(name: &str, _reader: &mut NodeReader<'_>) -> Result<Self> {
        Ok(SinkNode::new(name))
    }
}

impl Node for SinkNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        0
    }

    fn forward(&mut self, inputs: &[Tensor], _ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        expect_inputs(&self.name, inputs, 1)?;
        self.blob = Some(inputs[0].clone());
        Ok(Vec::new())
    }

    fn backward(
        &mut self,
        _inputs: &[Tensor],
        _outputs: &[Tensor],
        _output_diffs: &[Option<Tensor>],
        _ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![None])
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(SinkNode::new(self.name.clone()))
    }

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
