// Concurrent Inference Example — one trained network, many readers
//
// Trains a small regression network, then serves a batch of requests from
// every worker of a thread pool at once. Each worker drives its own
// reference network: same weights (shared, read-only), own buffers, own
// random stream.
//
// Architecture: Input(8) → FullyConnected(8,32) → ReLU → Dropout(0.1)
//               → FullyConnected(32,1) → Output, trained on y = mean(x)
//
// This example demonstrates:
//   1. Building a network with add_layer
//   2. Training with run_and_learn_once
//   3. create_reference and the learning-mode round trip
//   4. ThreadPool::scope with one reference per worker
//   5. Performance counters around the concurrent run

use std::sync::Arc;

use vole::prelude::*;

const FEATURES: usize = 8;
const BATCH: usize = 16;

fn batch(rng: &mut Random) -> vole::Result<(Tensor, Tensor)> {
    let x = Tensor::from_fn((BATCH, FEATURES), || rng.uniform(-1.0, 1.0) as f32);
    let y: Vec<f32> = x
        .to_vec()
        .chunks(FEATURES)
        .map(|row| row.iter().sum::<f32>() / FEATURES as f32)
        .collect();
    Ok((x, Tensor::from_vec(y, (BATCH, 1))?))
}

fn main() -> vole::Result<()> {
    println!("=== Vole — Concurrent Inference Example ===");
    println!();

    // 1. Build the network
    let mut net = Network::new(Arc::new(CpuEngine::new()), Random::new(2024));
    net.add_layer(SourceNode::new("in"), &[])?;
    net.add_layer(SourceNode::new("target"), &[])?;
    let hidden = FullyConnectedNode::new("hidden", FEATURES, 32, net.random_mut());
    net.add_layer(hidden, &["in"])?;
    net.add_layer(ActivationNode::relu("relu"), &["hidden"])?;
    net.add_layer(DropoutNode::new("drop", 0.1), &["relu"])?;
    let head = FullyConnectedNode::new("head", 32, 1, net.random_mut());
    net.add_layer(head, &["drop"])?;
    net.add_layer(EuclideanLossNode::new("loss"), &["head", "target"])?;
    net.add_layer(SinkNode::new("out"), &["head"])?;

    println!("Layers:     {}", net.layer_names().join(" → "));
    println!("Parameters: {}", net.parameter_count());
    println!();

    // 2. Train
    net.set_solver(Box::new(AdamSolver::new(0.01)));
    let mut data_rng = Random::new(7);
    for step in 0..=300 {
        let (x, y) = batch(&mut data_rng)?;
        net.set_input("in", x)?;
        net.set_input("target", y)?;
        net.run_and_learn_once()?;
        if step % 50 == 0 {
            let loss = net.layer_as::<EuclideanLossNode>("loss")?.last_loss();
            println!("  step {step:>3}  loss {loss:.5}");
        }
    }
    println!();

    // 3. One reference per worker
    let pool = ThreadPool::new(0);
    let mut refs: Vec<Network> = (0..pool.size())
        .map(|i| net.create_reference(Random::new(i as u64)))
        .collect();
    println!(
        "Pool of {} workers, {} references, learning enabled: {}",
        pool.size(),
        net.reference_count(),
        net.is_learning_enabled()
    );

    let requests: Vec<(Tensor, Tensor)> = (0..refs.len())
        .map(|_| batch(&mut data_rng))
        .collect::<vole::Result<_>>()?;
    for (reference, (x, y)) in refs.iter_mut().zip(&requests) {
        reference.set_input("in", x.clone())?;
        reference.set_input("target", y.clone())?;
    }

    // 4. Run them all at once
    let mut counters = net.engine().create_performance_counters();
    counters.synchronise();
    let mut losses = vec![0.0f32; refs.len()];
    pool.scope(|s| {
        for (worker, (reference, loss)) in refs.iter_mut().zip(losses.iter_mut()).enumerate() {
            s.add_task(worker, move |_| {
                if reference.run_once().is_ok() {
                    if let Ok(node) = reference.layer_as::<EuclideanLossNode>("loss") {
                        *loss = node.last_loss();
                    }
                }
            });
        }
    });
    counters.synchronise();

    for (worker, loss) in losses.iter().enumerate() {
        println!("  worker {worker:>2}  loss {loss:.5}");
    }
    println!();
    for counter in counters.counters() {
        println!("  {:<12} {}", counter.name, counter.value);
    }
    println!();

    // 5. Retire the references: learning comes back
    drop(refs);
    println!(
        "References released, learning enabled: {}",
        net.is_learning_enabled()
    );
    Ok(())
}
