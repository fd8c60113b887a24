// MathEngine — abstraction over the compute device
//
// Nodes never do arithmetic themselves; they call into a MathEngine. The
// engine is shared (Arc<dyn MathEngine>) by an original network and every
// reference network created from it, and it is called concurrently from
// pool workers, so implementations must be Send + Sync and keep no
// per-call mutable state.
//
// WHY A TRAIT OBJECT?
//
// Networks are built and cloned at runtime (reference networks are created
// on demand), so the engine is selected at runtime too. Every operation
// works on whole tensors and returns a new owned tensor, except `axpy`,
// which updates its destination in place and therefore requires an owned
// handle.
//
// CpuEngine is the portable reference implementation: straightforward loops
// with row-parallel matrix products on rayon's pool. Each output row is
// produced by exactly one task with a fixed summation order, so results are
// bit-identical regardless of how rows are split across threads.

use std::fmt;

use rayon::prelude::*;

use crate::counters::{CpuPerformanceCounters, PerformanceCounters};
use crate::error::{Error, Result};
use crate::memory;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// The kind of device an engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
        }
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
}

/// The compute-engine interface consumed by nodes, solvers and networks.
pub trait MathEngine: Send + Sync + fmt::Debug {
    /// Device this engine computes on.
    fn device_type(&self) -> DeviceType;

    /// A fresh set of performance counters for this engine.
    fn create_performance_counters(&self) -> Box<dyn PerformanceCounters>;

    /// Peak bytes held by tensors since start or the last reset.
    fn peak_memory_usage(&self) -> usize;

    /// Bytes currently held by tensors.
    fn current_memory_usage(&self) -> usize;

    /// Restart peak tracking from the current usage.
    fn reset_peak_memory_usage(&self);

    /// `a @ b^T` for `a: [m, k]`, `b: [n, k]`, giving `[m, n]`.
    fn matmul_transposed(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;

    /// `a @ b` for `a: [m, k]`, `b: [k, n]`, giving `[m, n]`.
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;

    /// `a^T @ b` for `a: [m, k]`, `b: [m, n]`, giving `[k, n]`.
    fn transposed_matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;

    /// Add the row vector `v: [n]` to every row of `x: [m, n]`.
    fn add_row_vector(&self, x: &Tensor, v: &Tensor) -> Result<Tensor>;

    /// Sum the rows of `x: [m, n]`, giving `[n]`.
    fn sum_rows(&self, x: &Tensor) -> Result<Tensor>;

    /// Element-wise activation.
    fn unary(&self, op: UnaryOp, x: &Tensor) -> Result<Tensor>;

    /// Gradient of `unary(op, x)` given the forward input `x`, its output
    /// `y` and the output gradient `dy`.
    fn unary_diff(&self, op: UnaryOp, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor>;

    /// Element-wise binary op on equally shaped tensors.
    fn binary(&self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor>;

    /// `x * factor`.
    fn scale(&self, x: &Tensor, factor: f32) -> Result<Tensor>;

    /// Sum of all elements.
    fn sum(&self, x: &Tensor) -> f32;

    /// In place: `dst += alpha * src`. `dst` must be an owned handle.
    fn axpy(&self, dst: &Tensor, src: &Tensor, alpha: f32) -> Result<()>;
}

/// Portable CPU implementation of [`MathEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        CpuEngine
    }
}

/// View a tensor as a matrix: `[batch, row_len]`.
fn as_matrix(t: &Tensor) -> (usize, usize) {
    (t.shape().batch(), t.shape().row_len())
}

fn check_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.elem_count() != b.elem_count() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(())
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

impl MathEngine for CpuEngine {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn create_performance_counters(&self) -> Box<dyn PerformanceCounters> {
        Box::new(CpuPerformanceCounters::new())
    }

    fn peak_memory_usage(&self) -> usize {
        memory::peak_bytes()
    }

    fn current_memory_usage(&self) -> usize {
        memory::current_bytes()
    }

    fn reset_peak_memory_usage(&self) {
        memory::reset_peak();
    }

    fn matmul_transposed(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let (m, k1) = as_matrix(a);
        let (n, k2) = as_matrix(b);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let a_data = a.read();
        let b_data = b.read();
        let mut out = vec![0.0f32; m * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                let a_row = &a_data[i * k1..(i + 1) * k1];
                for (j, o) in row.iter_mut().enumerate() {
                    let b_row = &b_data[j * k2..(j + 1) * k2];
                    *o = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
                }
            });
        }
        Tensor::from_vec(out, (m, n))
    }

    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let (m, k1) = as_matrix(a);
        let (k2, n) = as_matrix(b);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let a_data = a.read();
        let b_data = b.read();
        let mut out = vec![0.0f32; m * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for p in 0..k1 {
                    let av = a_data[i * k1 + p];
                    let b_row = &b_data[p * n..(p + 1) * n];
                    for (o, bv) in row.iter_mut().zip(b_row) {
                        *o += av * bv;
                    }
                }
            });
        }
        Tensor::from_vec(out, (m, n))
    }

    fn transposed_matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let (m1, k) = as_matrix(a);
        let (m2, n) = as_matrix(b);
        if m1 != m2 {
            return Err(Error::MatmulShapeMismatch {
                m: k,
                k1: m1,
                k2: m2,
                n,
            });
        }
        let a_data = a.read();
        let b_data = b.read();
        let mut out = vec![0.0f32; k * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(p, row)| {
                for i in 0..m1 {
                    let av = a_data[i * k + p];
                    let b_row = &b_data[i * n..(i + 1) * n];
                    for (o, bv) in row.iter_mut().zip(b_row) {
                        *o += av * bv;
                    }
                }
            });
        }
        Tensor::from_vec(out, (k, n))
    }

    fn add_row_vector(&self, x: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (m, n) = as_matrix(x);
        if v.elem_count() != n {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(n),
                got: v.shape().clone(),
            });
        }
        let mut out = x.to_vec();
        let v_data = v.read();
        for row in out.chunks_mut(n.max(1)).take(m) {
            for (o, b) in row.iter_mut().zip(v_data.iter()) {
                *o += b;
            }
        }
        Tensor::from_vec(out, x.shape().clone())
    }

    fn sum_rows(&self, x: &Tensor) -> Result<Tensor> {
        let (_, n) = as_matrix(x);
        let mut out = vec![0.0f32; n];
        let data = x.read();
        for row in data.chunks(n.max(1)) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Tensor::from_vec(out, n)
    }

    fn unary(&self, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        let data = x.read();
        let out: Vec<f32> = match op {
            UnaryOp::Relu => data.iter().map(|&v| v.max(0.0)).collect(),
            UnaryOp::Sigmoid => data.iter().map(|&v| sigmoid(v)).collect(),
            UnaryOp::Tanh => data.iter().map(|&v| v.tanh()).collect(),
        };
        Tensor::from_vec(out, x.shape().clone())
    }

    fn unary_diff(&self, op: UnaryOp, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        check_same_shape(x, dy)?;
        check_same_shape(y, dy)?;
        let x_data = x.read();
        let y_data = y.read();
        let dy_data = dy.read();
        let out: Vec<f32> = match op {
            UnaryOp::Relu => x_data
                .iter()
                .zip(dy_data.iter())
                .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
                .collect(),
            UnaryOp::Sigmoid => y_data
                .iter()
                .zip(dy_data.iter())
                .map(|(&s, &g)| g * s * (1.0 - s))
                .collect(),
            UnaryOp::Tanh => y_data
                .iter()
                .zip(dy_data.iter())
                .map(|(&t, &g)| g * (1.0 - t * t))
                .collect(),
        };
        Tensor::from_vec(out, dy.shape().clone())
    }

    fn binary(&self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        check_same_shape(a, b)?;
        let a_data = a.read();
        let b_data = b.read();
        let f: fn(f32, f32) -> f32 = match op {
            BinaryOp::Add => |x, y| x + y,
            BinaryOp::Sub => |x, y| x - y,
            BinaryOp::Mul => |x, y| x * y,
        };
        let out: Vec<f32> = a_data
            .iter()
            .zip(b_data.iter())
            .map(|(&x, &y)| f(x, y))
            .collect();
        Tensor::from_vec(out, a.shape().clone())
    }

    fn scale(&self, x: &Tensor, factor: f32) -> Result<Tensor> {
        let out: Vec<f32> = x.read().iter().map(|v| v * factor).collect();
        Tensor::from_vec(out, x.shape().clone())
    }

    fn sum(&self, x: &Tensor) -> f32 {
        x.read().iter().sum()
    }

    fn axpy(&self, dst: &Tensor, src: &Tensor, alpha: f32) -> Result<()> {
        check_same_shape(dst, src)?;
        if dst.shares_storage_with(src) {
            let mut d = dst.write()?;
            for v in d.iter_mut() {
                *v += alpha * *v;
            }
            return Ok(());
        }
        let s = src.read();
        let mut d = dst.write()?;
        for (o, v) in d.iter_mut().zip(s.iter()) {
            *o += alpha * v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: impl Into<Shape>) -> Tensor {
        Tensor::from_slice(data, shape).unwrap()
    }

    #[test]
    fn test_matmul_variants_agree() {
        let e = CpuEngine;
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let b = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2));
        let bt = t(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], (2, 3));

        let c = e.matmul(&a, &b).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.to_vec(), vec![4.0, 5.0, 10.0, 11.0]);

        let c2 = e.matmul_transposed(&a, &bt).unwrap();
        assert_eq!(c2.to_vec(), c.to_vec());

        // a^T @ a is [3, 3] and symmetric
        let g = e.transposed_matmul(&a, &a).unwrap();
        assert_eq!(g.dims(), &[3, 3]);
        let v = g.to_vec();
        assert_eq!(v[1], v[3]);
        assert_eq!(v[0], 17.0);
    }

    #[test]
    fn test_matmul_shape_error() {
        let e = CpuEngine;
        let a = Tensor::zeros((2, 3));
        let b = Tensor::zeros((2, 4));
        assert!(matches!(
            e.matmul_transposed(&a, &b),
            Err(Error::MatmulShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_bias_and_row_sum() {
        let e = CpuEngine;
        let x = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let b = t(&[10.0, 20.0], 2);
        let y = e.add_row_vector(&x, &b).unwrap();
        assert_eq!(y.to_vec(), vec![11.0, 22.0, 13.0, 24.0]);
        assert_eq!(e.sum_rows(&x).unwrap().to_vec(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_relu_and_diff() {
        let e = CpuEngine;
        let x = t(&[-1.0, 0.5, 2.0], 3);
        let y = e.unary(UnaryOp::Relu, &x).unwrap();
        assert_eq!(y.to_vec(), vec![0.0, 0.5, 2.0]);
        let dy = t(&[1.0, 1.0, 1.0], 3);
        let dx = e.unary_diff(UnaryOp::Relu, &x, &y, &dy).unwrap();
        assert_eq!(dx.to_vec(), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_sigmoid_diff_at_zero() {
        let e = CpuEngine;
        let x = t(&[0.0], 1);
        let y = e.unary(UnaryOp::Sigmoid, &x).unwrap();
        assert_eq!(y.to_vec(), vec![0.5]);
        let dx = e.unary_diff(UnaryOp::Sigmoid, &x, &y, &t(&[1.0], 1)).unwrap();
        assert_eq!(dx.to_vec(), vec![0.25]);
    }

    #[test]
    fn test_axpy_rejects_borrowed() {
        let e = CpuEngine;
        let w = t(&[1.0, 1.0], 2);
        let g = t(&[2.0, 4.0], 2);
        e.axpy(&w, &g, -0.5).unwrap();
        assert_eq!(w.to_vec(), vec![0.0, -1.0]);
        assert!(matches!(
            e.axpy(&w.share(), &g, 1.0),
            Err(Error::BorrowedStorage)
        ));
    }

    #[test]
    fn test_binary_and_scale() {
        let e = CpuEngine;
        let a = t(&[1.0, 2.0], 2);
        let b = t(&[3.0, 5.0], 2);
        assert_eq!(e.binary(BinaryOp::Sub, &a, &b).unwrap().to_vec(), vec![-2.0, -3.0]);
        assert_eq!(e.binary(BinaryOp::Mul, &a, &b).unwrap().to_vec(), vec![3.0, 10.0]);
        assert_eq!(e.scale(&a, 2.0).unwrap().to_vec(), vec![2.0, 4.0]);
        assert_eq!(e.sum(&b), 8.0);
        assert!(e.binary(BinaryOp::Add, &a, &Tensor::zeros(3)).is_err());
    }
}
