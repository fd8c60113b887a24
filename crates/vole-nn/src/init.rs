// init — Parameter initialisation
//
// Every initialiser draws from the network's own `Random`, so two networks
// built from the same seed start from bit-identical weights.
//
// AVAILABLE INITIALIZERS:
//
//   uniform(shape, low, high, rng)         — U(low, high)
//   kaiming_uniform(shape, a, rng)         — He uniform over fan_in
//
// Both return owned tensors.

use vole_core::{Random, Shape, Tensor};

/// fan_in of a shape: `dims[0]` for 1-D, `dims[1] * receptive field` for
/// `[out, in, ...]`.
fn fan_in(shape: &Shape) -> f64 {
    let dims = shape.dims();
    match dims.len() {
        0 => 1.0,
        1 => dims[0] as f64,
        _ => {
            let receptive_field: usize = dims[2..].iter().product();
            dims[1] as f64 * receptive_field as f64
        }
    }
}

/// U(low, high).
pub fn uniform(shape: impl Into<Shape>, low: f64, high: f64, random: &mut Random) -> Tensor {
    Tensor::from_fn(shape, || random.uniform(low, high) as f32)
}

/// Kaiming (He) uniform: U(-bound, bound), bound = gain * sqrt(3 / fan_in),
/// gain = sqrt(2 / (1 + a²)). `a` is the negative slope of the following
/// rectifier (0 for ReLU).
pub fn kaiming_uniform(shape: impl Into<Shape>, a: f64, random: &mut Random) -> Tensor {
    let shape = shape.into();
    let fan = fan_in(&shape);
    let gain = (2.0 / (1.0 + a * a)).sqrt();
    let bound = gain * (3.0 / fan.max(1.0)).sqrt();
    uniform(shape, -bound, bound, random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaiming_uniform_bounds() {
        let mut rng = Random::new(3);
        // fan_in = 100 for shape (50, 100), gain = sqrt(2) for ReLU (a=0)
        let t = kaiming_uniform((50, 100), 0.0, &mut rng);
        assert_eq!(t.dims(), &[50, 100]);
        let bound = (3.0 * 2.0 / 100.0_f64).sqrt() as f32;
        for &x in t.read().iter() {
            assert!(
                x >= -bound - 1e-6 && x <= bound + 1e-6,
                "value {} out of bounds [-{}, {}]",
                x,
                bound,
                bound
            );
        }
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = kaiming_uniform((8, 4), 5f64.sqrt(), &mut Random::new(11));
        let b = kaiming_uniform((8, 4), 5f64.sqrt(), &mut Random::new(11));
        assert!(a.bitwise_eq(&b));
    }

    #[test]
    fn test_uniform_range() {
        let t = uniform(64, -0.5, 0.25, &mut Random::new(2));
        assert!(t.read().iter().all(|&v| (-0.5..=0.25).contains(&v)));
    }
}
