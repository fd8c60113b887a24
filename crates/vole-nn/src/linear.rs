// FullyConnectedNode — Fully-connected (dense) layer
//
// y = x W^T + b
//
// The input may have any rank; it is viewed as [batch, in_features] where
// batch is the first dimension and in_features the product of the rest.
//
// WEIGHT INITIALIZATION:
//
// Kaiming (He) uniform, drawn from the network's Random when the node is
// created, so a node's parameters exist before the network ever runs and a
// reference network can alias them immediately.
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]  — stored transposed for the matmul
//   bias:   [out_features]               — added to every row
//
// BACKWARD:
//
//   dx = dy @ W            [batch, in]
//   dW = dy^T @ x          [out, in]
//   db = sum_rows(dy)      [out]

use std::any::Any;

use vole_core::{Error, Random, Result, Shape, Tensor};

use crate::init;
use crate::node::{expect_inputs, Node, NodeKind, NodeReader, NodeWriter, RunContext};

/// A fully-connected (dense) layer.
///
/// # Examples
/// ```
/// use vole_core::Random;
/// use vole_nn::{FullyConnectedNode, Node};
///
/// let mut rng = Random::new(42);
/// let fc = FullyConnectedNode::new("fc1", 784, 128, &mut rng);
/// assert_eq!(fc.weight().dims(), &[128, 784]);
/// assert_eq!(fc.parameters().len(), 2);
/// ```
pub struct FullyConnectedNode {
    name: String,
    in_features: usize,
    out_features: usize,
    weight: Tensor,
    bias: Tensor,
    weight_grad: Option<Tensor>,
    bias_grad: Option<Tensor>,
}

impl FullyConnectedNode {
    /// Create a layer with Kaiming uniform weights and bias in U(-k, k),
    /// k = sqrt(1 / in_features).
    pub fn new(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        random: &mut Random,
    ) -> Self {
        let weight = init::kaiming_uniform((out_features, in_features), 5f64.sqrt(), random);
        let k = (1.0 / in_features.max(1) as f64).sqrt();
        let bias = init::uniform(out_features, -k, k, random);
        FullyConnectedNode {
            name: name.into(),
            in_features,
            out_features,
            weight,
            bias,
            weight_grad: None,
            bias_grad: None,
        }
    }

    /// Create a layer from existing tensors: weight `[out, in]`, bias `[out]`.
    pub fn from_tensors(name: impl Into<String>, weight: Tensor, bias: Tensor) -> Result<Self> {
        let name = name.into();
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::msg(format!(
                "fully connected layer '{name}': weight must be 2D, got shape {}",
                weight.shape()
            )));
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if bias.dims() != &[out_features] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(out_features),
                got: bias.shape().clone(),
            });
        }
        Ok(FullyConnectedNode {
            name,
            in_features,
            out_features,
            weight,
            bias,
            weight_grad: None,
            bias_grad: None,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// `x` viewed as `[batch, in_features]`.
    fn flatten_input(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.shape().batch();
        if x.shape().row_len() != self.in_features || x.shape().rank() == 0 {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((batch, self.in_features)),
                got: x.shape().clone(),
            });
        }
        x.reshape((batch, self.in_features))
    }

    pub(crate) fn load(name: &str, reader: &mut NodeReader<'_>) -> Result<Self> {
        let in_features = reader.read_len()?;
        let out_features = reader.read_len()?;
        let weight = reader.read_tensor()?;
        let bias = reader.read_tensor()?;
        let node = FullyConnectedNode::from_tensors(name, weight, bias)
            .map_err(|e| Error::archive(format!("layer '{name}': {e}")))?;
        if node.in_features != in_features || node.out_features != out_features {
            return Err(Error::archive(format!(
                "layer '{name}': declared {in_features}->{out_features}, weight is {}",
                node.weight.shape()
            )));
        }
        Ok(node)
    }
}

impl Node for FullyConnectedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::FullyConnected
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn forward(&mut self, inputs: &[Tensor], ctx: &mut RunContext<'_>) -> Result<Vec<Tensor>> {
        expect_inputs(&self.name, inputs, 1)?;
        let x = self.flatten_input(&inputs[0])?;
        let y = ctx.engine.matmul_transposed(&x, &self.weight)?;
        let y = ctx.engine.add_row_vector(&y, &self.bias)?;
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
            self.weight_grad = None;
            self.bias_grad = None;
            return Ok(vec![None]);
        };
        let x = self.flatten_input(&inputs[0])?;
        self.weight_grad = Some(ctx.engine.transposed_matmul(dy, &x)?);
        self.bias_grad = Some(ctx.engine.sum_rows(dy)?);
        let dx = ctx.engine.matmul(dy, &self.weight)?;
        Ok(vec![Some(dx.reshape(inputs[0].shape().clone())?)])
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn parameter_grads(&self) -> Vec<Option<Tensor>> {
        vec![self.weight_grad.clone(), self.bias_grad.clone()]
    }

    fn share(&self) -> Box<dyn Node> {
        Box::new(FullyConnectedNode {
            name: self.name.clone(),
            in_features: self.in_features,
            out_features: self.out_features,
            weight: self.weight.share(),
            bias: self.bias.share(),
            weight_grad: None,
            bias_grad: None,
        })
    }

    fn save(&self, writer: &mut NodeWriter<'_>) -> Result<()> {
        writer.write_len(self.in_features)?;
        writer.write_len(self.out_features)?;
        writer.write_tensor(&self.weight)?;
        writer.write_tensor(&self.bias)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
