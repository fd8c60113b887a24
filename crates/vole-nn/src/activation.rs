// ActivationNode — element-wise non-linearity
//
// One node type covers every activation the engine implements; the concrete
// function is a `UnaryOp`. Backward goes through `MathEngine::unary_diff`,
// which receives both the forward input and output so that each activation
// can use whichever form of its derivative is cheapest.

use std::any::Any;

use vole_core::{Error, Result, Tensor, UnaryOp};

use crate::node::{expect_inputs, Node, NodeKind, NodeReader, NodeWriter, RunContext};

pub struct ActivationNode {
    name: String,
    op: UnaryOp,
}

impl ActivationNode {
    pub fn new(name: impl Into<String>, op: UnaryOp) -> Self {
        ActivationNode {
            name: name.into(),
            op,
        }
    }

    pub fn relu(name: impl Into<String>) -> Self {
        Self::new(name, UnaryOp::Relu)
    }

    pub fn sigmoid(name: impl Into<String>) -> Self {
        Self::new(name, UnaryOp::Sigmoid)
    }

    pub fn tanh(name: impl Into<String>) -> Self {
        Self::new(name, UnaryOp::Tanh)
    }

    pub fn op(&self) -> UnaryOp {
        self.op
    }

    pub(crate) fn load(name: &str, reader: &mut NodeReader<'_>) -> Result<Self> {
        let op = match reader.read_u8()? {
            0 => UnaryOp::Relu,
            1 => UnaryOp::Sigmoid,
            2 => UnaryOp::Tanh,
            tag => {
                return Err(Error::archive(format!(
                    "layer '{name}': unknown activation tag {tag}"
                )))
            }
        };
        Ok(ActivationNode::new(name, op))
    }
}

fn op_tag(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Relu => 0,
        UnaryOp::Sigmoid => 1,
        UnaryOp::Tanh => 2,
    }
}

impl Node for ActivationNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Activation
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn forward(&mut self, inputs: &[Tensor], ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        expect_inputs(&self.name, inputs, 1)?;
        Ok(vec![ctx.engine.unary(self.op, &inputs[0])?])
    }

    fn backward(
        &mut self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        output_diffs: &[Option<Tensor>],
        ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        expect_inputs(&self.name, inputs, 1)?;
        let (Some(dy), Some(y)) = (output_diffs.first().and_then(|d| d.as_ref()), outputs.first())
        else {
            return Ok(vec![None]);
        };
        let dx = ctx.engine.unary_diff(self.op, &inputs[0], y, dy)?;
        Ok(vec![Some(dx)])
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(ActivationNode::new(self.name.clone(), self.op))
    }

    fn save(&self, writer: &mut NodeWriter<'_>) -> Result<()> {
        writer.write_u8(op_tag(self.op))
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
    fn test_relu_forward_backward() {
        let engine = CpuEngine::new();
        let mut rng = Random::new(0);
        let mut ctx = RunContext {
            engine: &engine,
            random: &mut rng,
            learning: true,
        };
        let mut act = ActivationNode::relu("act");
        let x = Tensor::from_vec(vec![-1.0, 0.5, 2.0, -3.0], (2, 2)).unwrap();
        let y = act.forward(&[x.clone()], &mut ctx).unwrap();
        assert_eq!(y[0].to_vec(), vec![0.0, 0.5, 2.0, 0.0]);

        let dy = Tensor::full((2, 2), 1.0);
        let dx = act.backward(&[x], &y, &[Some(dy)], &mut ctx).unwrap();
        assert_eq!(dx[0].as_ref().unwrap().to_vec(), vec![0.0, 1.0, 1.0, 0.0]);
        assert!(!act.is_trainable());
    }
}
