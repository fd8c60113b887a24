// Solvers — parameter update rules applied after a backward pass
//
// A solver sees one (parameter, gradient) pair at a time, identified by a
// stable key "layer/index". Per-parameter state (momentum, Adam moments) is
// kept in a BTreeMap under that key, so it survives across steps and is
// serialized in a deterministic order.
//
//   SimpleGradientSolver (SGD with momentum):
//     g = grad + weight_decay * param
//     v = momentum * v - lr * g
//     param += v
//
//   AdamSolver:
//     g = grad + weight_decay * param
//     m = β1 m + (1 - β1) g
//     v = β2 v + (1 - β2) g²
//     param -= lr * m̂ / (sqrt(v̂) + ε)     with bias-corrected m̂, v̂
//
// Parameters are updated in place through `MathEngine::axpy`, which requires
// an owned handle: a solver can never write through a reference network's
// borrowed parameters.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use vole_core::{ArchiveReader, ArchiveWriter, BinaryOp, Error, MathEngine, Result, Tensor};

/// Archive writer handed to [`Solver::save`].
pub type SolverWriter<'a> = ArchiveWriter<&'a mut dyn Write>;

/// Archive reader handed to [`load_solver`].
pub type SolverReader<'a> = ArchiveReader<&'a mut dyn Read>;

/// Concrete solver type, used as the archive tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    SimpleGradient,
    Adam,
}

impl SolverKind {
    pub fn tag(self) -> u8 {
        match self {
            SolverKind::SimpleGradient => 1,
            SolverKind::Adam => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(SolverKind::SimpleGradient),
            2 => Ok(SolverKind::Adam),
            _ => Err(Error::archive(format!("unknown solver tag {tag}"))),
        }
    }
}

/// A parameter update rule.
pub trait Solver: Send {
    fn kind(&self) -> SolverKind;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    /// Called once per training step, before any `update`.
    fn begin_step(&mut self) {}

    /// Apply one update to `param` given its gradient.
    fn update(
        &mut self,
        key: &str,
        param: &Tensor,
        grad: &Tensor,
        engine: &dyn MathEngine,
    ) -> Result<()>;

    /// Forget all per-parameter state.
    fn reset(&mut self);

    /// Write hyper-parameters and state.
    fn save(&self, writer: &mut SolverWriter<'_>) -> Result<()>;
}

/// Rebuild a solver written by [`Solver::save`].
pub fn load_solver(kind: SolverKind, reader: &mut SolverReader<'_>) -> Result<Box<dyn Solver>> {
    Ok(match kind {
        SolverKind::SimpleGradient => Box::new(SimpleGradientSolver::load(reader)?),
        SolverKind::Adam => Box::new(AdamSolver::load(reader)?),
    })
}

fn write_state(writer: &mut SolverWriter<'_>, state: &BTreeMap<String, Tensor>) -> Result<()> {
    writer.write_len(state.len())?;
    for (key, tensor) in state {
        writer.write_str(key)?;
        writer.write_tensor(tensor)?;
    }
    Ok(())
}

fn read_state(reader: &mut SolverReader<'_>) -> Result<BTreeMap<String, Tensor>> {
    let count = reader.read_len()?;
    let mut state = BTreeMap::new();
    for _ in 0..count {
        let key = reader.read_string()?;
        let tensor = reader.read_tensor()?;
        state.insert(key, tensor);
    }
    Ok(state)
}

/// `grad + weight_decay * param`.
fn regularized(
    engine: &dyn MathEngine,
    param: &Tensor,
    grad: &Tensor,
    weight_decay: f32,
) -> Result<Tensor> {
    if weight_decay == 0.0 {
        return Ok(grad.clone());
    }
    let decay = engine.scale(param, weight_decay)?;
    engine.binary(BinaryOp::Add, grad, &decay)
}

// SimpleGradientSolver

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug)]
pub struct SimpleGradientSolver {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: BTreeMap<String, Tensor>,
}

impl SimpleGradientSolver {
    pub fn new(lr: f32) -> Self {
        SimpleGradientSolver {
            lr,
            momentum: 0.9,
            weight_decay: 0.0,
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    fn load(reader: &mut SolverReader<'_>) -> Result<Self> {
        let lr = reader.read_f32()?;
        let momentum = reader.read_f32()?;
        let weight_decay = reader.read_f32()?;
        let velocity = read_state(reader)?;
        Ok(SimpleGradientSolver {
            lr,
            momentum,
            weight_decay,
            velocity,
        })
    }
}

impl Default for SimpleGradientSolver {
    fn default() -> Self {
        SimpleGradientSolver::new(0.01)
    }
}

impl Solver for SimpleGradientSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::SimpleGradient
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn update(
        &mut self,
        key: &str,
        param: &Tensor,
        grad: &Tensor,
        engine: &dyn MathEngine,
    ) -> Result<()> {
        let g = regularized(engine, param, grad, self.weight_decay)?;
        let step = engine.scale(&g, -self.lr)?;
        let v = match self.velocity.get(key) {
            Some(prev) if self.momentum != 0.0 => {
                let carried = engine.scale(prev, self.momentum)?;
                engine.binary(BinaryOp::Add, &carried, &step)?
            }
            _ => step,
        };
        engine.axpy(param, &v, 1.0)?;
        self.velocity.insert(key.to_string(), v);
        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }

    fn save(&self, writer: &mut SolverWriter<'_>) -> Result<()> {
        writer.write_f32(self.lr)?;
        writer.write_f32(self.momentum)?;
        writer.write_f32(self.weight_decay)?;
        write_state(writer, &self.velocity)
    }
}

// AdamSolver

/// Adam with bias correction.
#[derive(Debug)]
pub struct AdamSolver {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    step: u64,
    first_moment: BTreeMap<String, Tensor>,
    second_moment: BTreeMap<String, Tensor>,
}

impl AdamSolver {
    pub fn new(lr: f32) -> Self {
        AdamSolver {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            step: 0,
            first_moment: BTreeMap::new(),
            second_moment: BTreeMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of training steps taken.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    fn load(reader: &mut SolverReader<'_>) -> Result<Self> {
        let lr = reader.read_f32()?;
        let beta1 = reader.read_f32()?;
        let beta2 = reader.read_f32()?;
        let epsilon = reader.read_f32()?;
        let weight_decay = reader.read_f32()?;
        let step = reader.read_u64()?;
        let first_moment = read_state(reader)?;
        let second_moment = read_state(reader)?;
        Ok(AdamSolver {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step,
            first_moment,
            second_moment,
        })
    }
}

impl Solver for AdamSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Adam
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn begin_step(&mut self) {
        self.step += 1;
    }

    fn update(
        &mut self,
        key: &str,
        param: &Tensor,
        grad: &Tensor,
        engine: &dyn MathEngine,
    ) -> Result<()> {
        let g = regularized(engine, param, grad, self.weight_decay)?;
        let g = g.read();
        let n = g.len();
        let t = self.step.max(1) as i32;
        let (b1, b2) = (self.beta1, self.beta2);

        let mut m = match self.first_moment.get(key) {
            Some(prev) => prev.to_vec(),
            None => vec![0.0; n],
        };
        let mut v = match self.second_moment.get(key) {
            Some(prev) => prev.to_vec(),
            None => vec![0.0; n],
        };
        if m.len() != n || v.len() != n {
            return Err(Error::ShapeMismatch {
                expected: param.shape().clone(),
                got: grad.shape().clone(),
            });
        }

        let correction1 = 1.0 - b1.powi(t);
        let correction2 = 1.0 - b2.powi(t);
        let mut delta = Vec::with_capacity(n);
        for i in 0..n {
            m[i] = b1 * m[i] + (1.0 - b1) * g[i];
            v[i] = b2 * v[i] + (1.0 - b2) * g[i] * g[i];
            let m_hat = m[i] / correction1;
            let v_hat = v[i] / correction2;
            delta.push(-self.lr * m_hat / (v_hat.sqrt() + self.epsilon));
        }
        drop(g);

        let shape = param.shape().clone();
        engine.axpy(param, &Tensor::from_vec(delta, shape.clone())?, 1.0)?;
        self.first_moment
            .insert(key.to_string(), Tensor::from_vec(m, shape.clone())?);
        self.second_moment
            .insert(key.to_string(), Tensor::from_vec(v, shape)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.step = 0;
        self.first_moment.clear();
        self.second_moment.clear();
    }

    fn save(&self, writer: &mut SolverWriter<'_>) -> Result<()> {
        writer.write_f32(self.lr)?;
        writer.write_f32(self.beta1)?;
        writer.write_f32(self.beta2)?;
        writer.write_f32(self.epsilon)?;
        writer.write_f32(self.weight_decay)?;
        writer.write_u64(self.step)?;
        write_state(writer, &self.first_moment)?;
        write_state(writer, &self.second_moment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::CpuEngine;

    fn assert_vec_approx(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len(), "length mismatch");
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < tol, "index {}: {} vs {} (tol={})", i, x, y, tol);
        }
    }

    #[test]
    fn test_sgd_momentum() {
        let engine = CpuEngine::new();
        let mut sgd = SimpleGradientSolver::new(0.1).with_momentum(0.5);
        let p = Tensor::from_vec(vec![1.0, -1.0], 2).unwrap();
        let g = Tensor::from_vec(vec![1.0, 2.0], 2).unwrap();

        sgd.update("fc/0", &p, &g, &engine).unwrap();
        // v = -0.1 g
        assert_vec_approx(&p.to_vec(), &[0.9, -1.2], 1e-6);
        sgd.update("fc/0", &p, &g, &engine).unwrap();
        // v = 0.5 * v - 0.1 g = -0.15 g
        assert_vec_approx(&p.to_vec(), &[0.75, -1.5], 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let engine = CpuEngine::new();
        let mut sgd = SimpleGradientSolver::new(1.0)
            .with_momentum(0.0)
            .with_weight_decay(0.5);
        let p = Tensor::from_vec(vec![2.0], 1).unwrap();
        let g = Tensor::zeros(1);
        sgd.update("w", &p, &g, &engine).unwrap();
        assert_vec_approx(&p.to_vec(), &[1.0], 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let engine = CpuEngine::new();
        let mut adam = AdamSolver::new(0.01);
        adam.begin_step();
        let p = Tensor::from_vec(vec![0.0, 0.0], 2).unwrap();
        let g = Tensor::from_vec(vec![3.0, -0.5], 2).unwrap();
        adam.update("w", &p, &g, &engine).unwrap();
        // With bias correction the first step is ±lr regardless of |g|.
        assert_vec_approx(&p.to_vec(), &[-0.01, 0.01], 1e-5);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_update_rejects_borrowed_parameter() {
        let engine = CpuEngine::new();
        let mut sgd = SimpleGradientSolver::default();
        let owner = Tensor::from_vec(vec![1.0], 1).unwrap();
        let shared = owner.share();
        let g = Tensor::full(1, 1.0);
        assert!(matches!(
            sgd.update("w", &shared, &g, &engine),
            Err(Error::BorrowedStorage)
        ));
        assert_eq!(owner.to_vec(), vec![1.0]);
    }

    #[test]
    fn test_state_round_trip() {
        let engine = CpuEngine::new();
        let mut sgd = SimpleGradientSolver::new(0.1);
        let p = Tensor::from_vec(vec![1.0, 2.0], 2).unwrap();
        sgd.update("fc/1", &p, &Tensor::full(2, 1.0), &engine).unwrap();

        let mut bytes = Vec::new();
        sgd.save(&mut ArchiveWriter::new(&mut bytes as &mut dyn Write))
            .unwrap();
        let mut cursor = std::io::Cursor::new(bytes.clone());
        let loaded = load_solver(
            SolverKind::SimpleGradient,
            &mut ArchiveReader::new(&mut cursor as &mut dyn Read),
        )
        .unwrap();

        let mut again = Vec::new();
        loaded
            .save(&mut ArchiveWriter::new(&mut again as &mut dyn Write))
            .unwrap();
        assert_eq!(bytes, again);
        assert_eq!(loaded.learning_rate(), 0.1);
    }
}
