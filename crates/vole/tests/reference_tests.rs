// Integration tests for reference networks
//
// These tests verify that reference networks share their original's
// parameters without perturbing results or training, that the learning flag
// round-trips through the reference lifetime, and that contract violations
// fail fast.

use std::sync::Arc;

use vole::prelude::*;

const BATCH: usize = 4;
const IN: usize = 16;

fn engine() -> Arc<dyn MathEngine> {
    Arc::new(CpuEngine::new())
}

/// in → fc1(50) → drop1 → fc2(20) → drop2 → fc3(10) → out
fn build_mlp(seed: u64) -> vole::Result<Network> {
    let mut net = Network::new(engine(), Random::new(seed));
    net.add_layer(SourceNode::new("in"), &[])?;
    let fc1 = FullyConnectedNode::new("fc1", IN, 50, net.random_mut());
    net.add_layer(fc1, &["in"])?;
    net.add_layer(DropoutNode::new("drop1", 0.2), &["fc1"])?;
    let fc2 = FullyConnectedNode::new("fc2", 50, 20, net.random_mut());
    net.add_layer(fc2, &["drop1"])?;
    net.add_layer(DropoutNode::new("drop2", 0.2), &["fc2"])?;
    let fc3 = FullyConnectedNode::new("fc3", 20, 10, net.random_mut());
    net.add_layer(fc3, &["drop2"])?;
    net.add_layer(SinkNode::new("out"), &["fc3"])?;
    Ok(net)
}

/// in → fc(8) → drop → head(1) → loss ← target, head → out
fn build_regression(seed: u64) -> vole::Result<Network> {
    let mut net = Network::new(engine(), Random::new(seed));
    net.add_layer(SourceNode::new("in"), &[])?;
    net.add_layer(SourceNode::new("target"), &[])?;
    let fc = FullyConnectedNode::new("fc", IN, 8, net.random_mut());
    net.add_layer(fc, &["in"])?;
    net.add_layer(DropoutNode::new("drop", 0.25), &["fc"])?;
    let head = FullyConnectedNode::new("head", 8, 1, net.random_mut());
    net.add_layer(head, &["drop"])?;
    net.add_layer(EuclideanLossNode::new("loss"), &["head", "target"])?;
    net.add_layer(SinkNode::new("out"), &["head"])?;

    let x = random_input(11);
    let y: Vec<f32> = x
        .to_vec()
        .chunks(IN)
        .map(|row| row.iter().sum::<f32>() * 0.5)
        .collect();
    net.set_input("in", x)?;
    net.set_input("target", Tensor::from_vec(y, (BATCH, 1))?)?;
    Ok(net)
}

fn random_input(seed: u64) -> Tensor {
    let mut rng = Random::new(seed);
    Tensor::from_fn((BATCH, IN), || rng.uniform(-1.0, 1.0) as f32)
}

fn parameters(net: &Network) -> Vec<Vec<f32>> {
    net.graph()
        .nodes()
        .flat_map(|n| n.parameters())
        .map(|p| p.to_vec())
        .collect()
}

/// Run every network on its own pool worker and collect the "out" tensors.
fn run_concurrently(pool: &ThreadPool, nets: &mut [Network]) -> Vec<vole::Result<Tensor>> {
    let mut results: Vec<Option<vole::Result<Tensor>>> = nets.iter().map(|_| None).collect();
    pool.scope(|s| {
        for (i, (net, slot)) in nets.iter_mut().zip(results.iter_mut()).enumerate() {
            s.add_task(i % s.size(), move |_| {
                *slot = Some(net.run_once().and_then(|_| net.output("out")));
            });
        }
    });
    results
        .into_iter()
        .map(|r| r.expect("every task ran"))
        .collect()
}

// Output equality

#[test]
fn test_three_node_chain_with_four_references() -> vole::Result<()> {
    let mut net = Network::new(engine(), Random::new(5));
    net.add_layer(SourceNode::new("in"), &[])?;
    let fc = FullyConnectedNode::new("fc", IN, 8, net.random_mut());
    net.add_layer(fc, &["in"])?;
    net.add_layer(SinkNode::new("out"), &["fc"])?;

    let x = random_input(1);
    net.set_input("in", x.clone())?;
    net.run_once()?;
    let baseline = net.output("out")?;
    assert_eq!(baseline.dims(), &[BATCH, 8]);

    let mut refs: Vec<Network> = (0..4)
        .map(|i| net.create_reference(Random::new(1000 + i)))
        .collect();
    for r in &mut refs {
        r.set_input("in", x.clone())?;
    }

    let pool = ThreadPool::new(4);
    for out in run_concurrently(&pool, &mut refs) {
        assert!(out?.bitwise_eq(&baseline));
    }
    Ok(())
}

#[test]
fn test_references_match_original_with_stochastic_layers() -> vole::Result<()> {
    let mut net = build_mlp(42)?;
    let x = random_input(7);

    let mut refs: Vec<Network> = (0..6)
        .map(|i| net.create_reference(Random::new(i)))
        .collect();
    assert_eq!(net.reference_count(), 6);

    // Learning is off while references are alive, so dropout is the
    // identity everywhere and the random streams never matter.
    net.set_input("in", x.clone())?;
    net.run_once()?;
    let expected = net.output("out")?;

    for r in &mut refs {
        r.set_input("in", x.clone())?;
    }
    let pool = ThreadPool::new(3);
    for _ in 0..3 {
        for out in run_concurrently(&pool, &mut refs) {
            assert!(out?.bitwise_eq(&expected));
        }
    }
    Ok(())
}

#[test]
fn test_original_run_while_learning_matches_later_references() -> vole::Result<()> {
    let mut net = build_mlp(17)?;
    let x = random_input(5);

    // Dropout masks the original's outputs during this run.
    net.set_input("in", x.clone())?;
    net.run_once()?;

    let mut reference = net.create_reference(Random::new(99));
    reference.set_input("in", x)?;
    reference.run_once()?;
    let re_evaluated = net.run_once()?;

    assert!(re_evaluated >= 2, "dropout layers must re-run");
    assert!(net.output("out")?.bitwise_eq(&reference.output("out")?));
    Ok(())
}

#[test]
fn test_disable_learning_drops_masked_outputs() -> vole::Result<()> {
    let mut net = build_mlp(23)?;
    let x = random_input(6);
    net.set_input("in", x.clone())?;
    net.run_once()?;

    net.disable_learning();
    net.run_once()?;
    let inference = net.output("out")?;
    assert_eq!(net.run_once()?, 0);

    let mut fresh = build_mlp(23)?;
    fresh.disable_learning();
    fresh.set_input("in", x)?;
    fresh.run_once()?;
    assert!(inference.bitwise_eq(&fresh.output("out")?));
    Ok(())
}

#[test]
fn test_references_share_storage() -> vole::Result<()> {
    let net = build_mlp(3)?;
    let reference = net.create_reference(Random::new(0));

    for (own, shared) in net
        .graph()
        .nodes()
        .flat_map(|n| n.parameters())
        .zip(reference.graph().nodes().flat_map(|n| n.parameters()))
    {
        assert!(own.shares_storage_with(&shared));
        assert_eq!(own.provenance(), Provenance::Owned);
        assert_eq!(shared.provenance(), Provenance::Borrowed);
    }
    assert_eq!(net.parameter_count(), reference.parameter_count());
    Ok(())
}

#[test]
fn test_reference_outputs_are_private() -> vole::Result<()> {
    let net = build_mlp(8)?;
    let mut a = net.create_reference(Random::new(1));
    let mut b = net.create_reference(Random::new(2));

    a.set_input("in", random_input(1))?;
    b.set_input("in", random_input(2))?;
    a.run_once()?;
    b.run_once()?;
    let out_a = a.output("out")?;
    let out_b = b.output("out")?;

    assert!(!out_a.shares_storage_with(&out_b));
    assert!(!out_a.bitwise_eq(&out_b));
    assert!(matches!(net.output("out"), Err(Error::MissingBlob { .. })));
    Ok(())
}

#[test]
fn test_performance_counters_around_concurrent_run() -> vole::Result<()> {
    let net = build_mlp(9)?;
    let mut refs: Vec<Network> = (0..2)
        .map(|i| net.create_reference(Random::new(i)))
        .collect();
    for r in &mut refs {
        r.set_input("in", random_input(4))?;
    }

    let engine = net.engine();
    let mut counters = engine.create_performance_counters();
    counters.synchronise();
    let pool = ThreadPool::new(2);
    for out in run_concurrently(&pool, &mut refs) {
        out?;
    }
    counters.synchronise();

    assert_eq!(counters.len(), 3);
    assert!(counters[1].value > 0, "peak memory should be non-zero");
    assert!(engine.peak_memory_usage() > 0);
    Ok(())
}

// Learning mode

#[test]
fn test_learning_flag_round_trip() -> vole::Result<()> {
    let mut net = build_mlp(1)?;
    assert!(net.is_learning_enabled());

    let refs: Vec<Network> = (0..3)
        .map(|i| net.create_reference(Random::new(i)))
        .collect();
    assert!(!net.is_learning_enabled());
    assert!(refs.iter().all(|r| !r.is_learning_enabled()));

    // Transient changes while references are alive do not survive.
    net.disable_learning();
    drop(refs);
    assert_eq!(net.reference_count(), 0);
    assert!(net.is_learning_enabled());

    net.disable_learning();
    let r = net.create_reference(Random::new(0));
    drop(r);
    assert!(!net.is_learning_enabled());

    net.enable_learning();
    assert!(net.is_learning_enabled());
    Ok(())
}

#[test]
fn test_references_dropped_on_workers() -> vole::Result<()> {
    let net = build_mlp(2)?;
    let pool = ThreadPool::new(4);
    for i in 0..4 {
        let reference = net.create_reference(Random::new(i));
        pool.add_task(i as usize, move |_| drop(reference));
    }
    pool.wait_all_tasks();
    assert_eq!(net.reference_count(), 0);
    assert_eq!(net.child_count(), 0);
    assert!(net.is_learning_enabled());
    Ok(())
}

#[test]
#[should_panic(expected = "cannot enable learning")]
fn test_enable_learning_with_live_reference_panics() {
    let mut net = build_mlp(0).unwrap();
    let _reference = net.create_reference(Random::new(0));
    net.enable_learning();
}

#[test]
fn test_training_a_reference_fails_fast() -> vole::Result<()> {
    let mut net = build_regression(4)?;
    let before = parameters(&net);
    let mut reference = net.create_reference(Random::new(0));

    assert!(matches!(
        reference.run_and_learn_once(),
        Err(Error::ReferenceNetwork)
    ));
    assert!(matches!(
        net.run_and_learn_once(),
        Err(Error::LearningDisabled)
    ));
    assert_eq!(parameters(&net), before);
    drop(reference);

    net.run_and_learn_once()?;
    assert_ne!(parameters(&net), before);
    Ok(())
}

#[test]
fn test_references_do_not_perturb_training() -> vole::Result<()> {
    const K: usize = 5;

    let mut baseline = build_regression(21)?;
    for _ in 0..2 * K {
        baseline.run_and_learn_once()?;
    }

    let mut net = build_regression(21)?;
    for _ in 0..K {
        net.run_and_learn_once()?;
    }
    let snapshot = parameters(&net);

    let mut refs: Vec<Network> = (0..2)
        .map(|i| net.create_reference(Random::new(77 + i)))
        .collect();
    for r in &mut refs {
        r.set_input("in", random_input(3))?;
        r.set_input("target", Tensor::zeros((BATCH, 1)))?;
    }
    let pool = ThreadPool::new(2);
    for out in run_concurrently(&pool, &mut refs) {
        out?;
    }
    drop(refs);
    assert_eq!(parameters(&net), snapshot);

    for _ in 0..K {
        net.run_and_learn_once()?;
    }
    for (got, expected) in parameters(&net).iter().zip(parameters(&baseline).iter()) {
        assert_eq!(got, expected);
    }
    Ok(())
}

// Chains

#[test]
fn test_chained_references_share_one_registry() -> vole::Result<()> {
    let net = build_mlp(6)?;
    let first = net.create_reference(Random::new(1));
    let second = first.create_reference(Random::new(2));

    assert!(second.is_reference());
    assert_eq!(net.reference_count(), 2);
    assert_eq!(net.child_count(), 1);
    assert_eq!(first.child_count(), 1);

    let w = net.layer_as::<FullyConnectedNode>("fc1")?.weight();
    let w2 = second.layer_as::<FullyConnectedNode>("fc1")?.weight();
    assert!(w.shares_storage_with(w2));

    drop(second);
    assert!(!net.is_learning_enabled());
    drop(first);
    assert!(net.is_learning_enabled());
    Ok(())
}

#[test]
#[should_panic(expected = "reference networks created from it are alive")]
fn test_dropping_original_with_live_reference_panics() {
    let net = build_mlp(0).unwrap();
    let _reference = net.create_reference(Random::new(0));
    drop(net);
}

#[test]
#[should_panic(expected = "reference networks created from it are alive")]
fn test_dropping_intermediate_reference_panics() {
    let net = build_mlp(0).unwrap();
    let first = net.create_reference(Random::new(1));
    let _second = first.create_reference(Random::new(2));
    drop(first);
}
