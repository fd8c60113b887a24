// DropoutNode — Regularization via random zeroing
//
// While the network is learning, each element is zeroed with probability
// `rate` and the survivors are scaled by 1/(1-rate) to preserve the expected
// value. The mask comes from the running network's Random, so reference
// networks (which never learn) are deterministic, and a learning network
// draws a fresh mask on every pass.
//
// Outside learning mode the node is the identity and emits its input handle
// unchanged.

use std::any::Any;

use vole_core::{BinaryOp, Error, Result, Tensor};

use crate::node::{expect_inputs, Node, NodeKind, NodeReader, NodeWriter, RunContext};

/// Applies dropout while learning; identity otherwise.
#[derive(Debug)]
pub struct DropoutNode {
    name: String,
    /// Probability of an element being zeroed.
    rate: f32,
    /// Scaled keep-mask from the last learning pass.
    mask: Option<Tensor>,
}

impl DropoutNode {
    /// Create a dropout node.
    ///
    /// # Panics
    ///
    /// If `rate` is not in `[0, 1)`.
    pub fn new(name: impl Into<String>, rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout probability must be in [0, 1)"
        );
        DropoutNode {
            name: name.into(),
            rate,
            mask: None,
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub(crate) fn load(name: &str, reader: &mut NodeReader<'_>) -> Result<Self> {
        let rate = reader.read_f32()?;
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::archive(format!(
                "layer '{name}': dropout rate {rate} not in [0, 1)"
            )));
        }
        Ok(DropoutNode::new(name, rate))
    }
}

impl Node for DropoutNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Dropout
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn is_stochastic(&self) -> bool {
        true
    }

    fn forward(&mut self, inputs: &[Tensor], ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        expect_inputs(&self.name, inputs, 1)?;
        let x = &inputs[0];
        if !ctx.learning || self.rate == 0.0 {
            self.mask = None;
            return Ok(vec![x.clone()]);
        }

        let keep = 1.0 - self.rate as f64;
        let scale = 1.0 / (1.0 - self.rate);
        let random = &mut *ctx.random;
        let mask = Tensor::from_fn(x.shape().clone(), || {
            if random.bernoulli(keep) {
                scale
            } else {
                0.0
            }
        });
        let y = ctx.engine.binary(BinaryOp::Mul, x, &mask)?;
        self.mask = Some(mask);
        Ok(vec![y])
    }

    fn backward(
        &mut self,
        inputs: &[Tensor],
        _outputs: &[Tensor],
        output_diffs: &[Option<Tensor>],
        ctx: &mut RunContext<'_>,
    ) -> Result<Vec<Option<Tensor>>> {
        expect_inputs(&self.name, inputs, 1)?;
        let Some(dy) = output_diffs.first().and_then(|d| d.as_ref()) else {
            return Ok(vec![None]);
        };
        let dx = match &self.mask {
            Some(mask) => ctx.engine.binary(BinaryOp::Mul, dy, mask)?,
            None => dy.clone(),
        };
        Ok(vec![Some(dx)])
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(DropoutNode::new(self.name.clone(), self.rate))
    }

    fn save(&self, writer: &mut NodeWriter<'_>) -> Result<()> {
        writer.write_f32(self.rate)
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
    fn test_identity_when_not_learning() {
        let engine = CpuEngine::new();
        let mut rng = Random::new(0);
        let mut ctx = RunContext {
            engine: &engine,
            random: &mut rng,
            learning: false,
        };
        let mut d = DropoutNode::new("drop", 0.5);
        let x = Tensor::full((4, 8), 1.0);
        let y = d.forward(&[x.clone()], &mut ctx).unwrap();
        assert!(y[0].shares_storage_with(&x));
    }

    #[test]
    fn test_mask_zeroes_and_scales() {
        let engine = CpuEngine::new();
        let mut rng = Random::new(5);
        let mut ctx = RunContext {
            engine: &engine,
            random: &mut rng,
            learning: true,
        };
        let mut d = DropoutNode::new("drop", 0.5);
        let x = Tensor::full((16, 16), 1.0);
        let y = d.forward(&[x.clone()], &mut ctx).unwrap();
        let values = y[0].to_vec();
        assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
        let zeros = values.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 64 && zeros < 192, "zeros = {zeros}");

        // Gradient follows the same mask.
        let dy = Tensor::full((16, 16), 1.0);
        let dx = d.backward(&[x], &y, &[Some(dy)], &mut ctx).unwrap();
        assert_eq!(dx[0].as_ref().unwrap().to_vec(), values);
    }

    #[test]
    #[should_panic(expected = "Dropout probability")]
    fn test_invalid_rate_panics() {
        DropoutNode::new("drop", 1.0);
    }
}
