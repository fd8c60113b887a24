// EuclideanLossNode — mean squared error as a graph layer
//
//   loss = weight * mean((prediction - target)²)
//
// Inputs: [prediction, target] with equal element counts. No outputs: a
// loss node is a sink for the forward pass and the origin of the backward
// pass. Its gradient w.r.t. the prediction is
//
//   d loss / d prediction = weight * 2 (prediction - target) / n
//
// and the negation of that w.r.t. the target.

use std::any::Any;

use vole_core::{BinaryOp, Error, Result, Tensor};

use crate::node::{expect_inputs, Node, NodeKind, NodeReader, NodeWriter, RunContext};

pub struct EuclideanLossNode {
    name: String,
    weight: f32,
    last_loss: f32,
    /// prediction - target, from the last forward pass.
    diff: Option<Tensor>,
}

impl EuclideanLossNode {
    pub fn new(name: impl Into<String>) -> Self {
        EuclideanLossNode {
            name: name.into(),
            weight: 1.0,
            last_loss: 0.0,
            diff: None,
        }
    }

    /// Scale the loss (and its gradient) by `weight`.
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Loss computed by the last forward pass.
    pub fn last_loss(&self) -> f32 {
        self.last_loss
    }

    pub(crate) fn load(name: &str, reader: &mut NodeReader<'_>) -> Result<Self> {
        let weight = reader.read_f32()?;
        Ok(EuclideanLossNode::new(name).with_weight(weight))
    }
}

impl Node for EuclideanLossNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::EuclideanLoss
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        0
    }

    fn forward(&mut self, inputs: &[Tensor], ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        expect_inputs(&self.name, inputs, 2)?;
        let (prediction, target) = (&inputs[0], &inputs[1]);
        if prediction.elem_count() != target.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: prediction.shape().clone(),
                got: target.shape().clone(),
            });
        }
        let diff = ctx.engine.binary(BinaryOp::Sub, prediction, target)?;
        let squared = ctx.engine.binary(BinaryOp::Mul, &diff, &diff)?;
        let n = prediction.elem_count().max(1) as f32;
        self.last_loss = self.weight * ctx.engine.sum(&squared) / n;
        self.diff = Some(diff);
        Ok(Vec::new())
    }

    fn backward(
        &mut self,
        inputs: &[Tensor],
        _outputs: &[Tensor],
        _output_diffs: &[Option<Tensor>],
        ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        expect_inputs(&self.name, inputs, 2)?;
        let Some(diff) = &self.diff else {
            return Ok(vec![None, None]);
        };
        let n = inputs[0].elem_count().max(1) as f32;
        let factor = 2.0 * self.weight / n;
        let d_prediction = ctx
            .engine
            .scale(diff, factor)?
            .reshape(inputs[0].shape().clone())?;
        let d_target = ctx
            .engine
            .scale(diff, -factor)?
            .reshape(inputs[1].shape().clone())?;
        Ok(vec![Some(d_prediction), Some(d_target)])
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(EuclideanLossNode::new(self.name.clone()).with_weight(self.weight))
    }

    fn save(&self, writer: &mut NodeWriter<'_>) -> Result<()> {
        writer.write_f32(self.weight)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
