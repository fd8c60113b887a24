// Network — a graph of layers plus everything needed to run and train it
//
// A network is either an ORIGINAL or a REFERENCE.
//
//   Original:  owns its parameter storage, has a learning flag (kept in its
//              ReferenceRegistry), and can be trained.
//
//   Reference: created by `create_reference()`. Same layers and wiring, but
//              every parameter is a Borrowed alias of the original's storage.
//              It owns its own inputs, outputs and random stream, so many
//              references can run concurrently (one per pool worker) against
//              one set of weights. It can never learn.
//
// LIFETIME RULES:
//
//   - While any reference is alive the original's learning is off, and
//     enabling it panics. Dropping the last reference restores the flag the
//     original had when the first one was created.
//   - A network must outlive the references created from it. Dropping a
//     network while its references are alive panics. References of
//     references follow the same rule: each network counts its own direct
//     children, while the learning flag always lives in the original's
//     registry.
//
// EXECUTION:
//
//   run_once()            forward pass, skipping layers whose inputs did not
//                         change since the last run (see `Graph::forward`)
//   run_and_learn_once()  full forward + backward + one solver step

use std::any::type_name;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vole_core::{Error, MathEngine, Random, Result, Tensor};
use vole_nn::{Node, RunContext, SinkNode, SourceNode};

use crate::graph::{Connection, Graph};
use crate::registry::{ReferenceLease, ReferenceRegistry};
use crate::solver::{SimpleGradientSolver, Solver};

/// Construction-time settings of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Initial learning flag of an original network (default: true).
    pub learning_enabled: bool,
    /// Skip layers whose inputs did not change (default: true).
    pub incremental: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            learning_enabled: true,
            incremental: true,
        }
    }
}

impl NetworkConfig {
    /// Set the initial learning flag.
    pub fn with_learning(mut self, enabled: bool) -> Self {
        self.learning_enabled = enabled;
        self
    }

    /// Enable or disable incremental execution.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

/// Whether a network owns its parameters.
#[derive(Debug)]
pub enum NetworkKind {
    Original { registry: Arc<ReferenceRegistry> },
    Reference { lease: ReferenceLease },
}

/// A neural network: graph, engine, random stream and solver.
pub struct Network {
    graph: Graph,
    engine: Arc<dyn MathEngine>,
    random: Random,
    solver: Option<Box<dyn Solver>>,
    kind: NetworkKind,
    /// Live references created directly from this network.
    children: Arc<AtomicUsize>,
    config: NetworkConfig,
}

impl Network {
    /// Create an empty original network with the default config.
    pub fn new(engine: Arc<dyn MathEngine>, random: Random) -> Self {
        Self::with_config(engine, random, NetworkConfig::default())
    }

    /// Create an empty original network.
    pub fn with_config(engine: Arc<dyn MathEngine>, random: Random, config: NetworkConfig) -> Self {
        Network {
            graph: Graph::new(),
            engine,
            random,
            solver: None,
            kind: NetworkKind::Original {
                registry: Arc::new(ReferenceRegistry::new(config.learning_enabled)),
            },
            children: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    // Accessors

    pub fn engine(&self) -> &Arc<dyn MathEngine> {
        &self.engine
    }

    pub fn random(&self) -> &Random {
        &self.random
    }

    /// The network's random stream, e.g. to initialise new layers.
    pub fn random_mut(&mut self) -> &mut Random {
        &mut self.random
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn kind(&self) -> &NetworkKind {
        &self.kind
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, NetworkKind::Reference { .. })
    }

    /// The registry shared by the original and all its references.
    fn registry(&self) -> &Arc<ReferenceRegistry> {
        match &self.kind {
            NetworkKind::Original { registry } => registry,
            NetworkKind::Reference { lease } => lease.registry(),
        }
    }

    /// Live references of the original network this one belongs to.
    pub fn reference_count(&self) -> usize {
        self.registry().reference_count()
    }

    /// Live references created directly from this network.
    pub fn child_count(&self) -> usize {
        self.children.load(Ordering::SeqCst)
    }

    fn ensure_original(&self) -> Result<()> {
        if self.is_reference() {
            return Err(Error::ReferenceNetwork);
        }
        Ok(())
    }

    // Topology

    /// Add a layer fed by output 0 of each named producer.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use vole::prelude::*;
    ///
    /// let mut net = Network::new(Arc::new(CpuEngine::new()), Random::new(1));
    /// net.add_layer(SourceNode::new("in"), &[])?;
    /// let fc = FullyConnectedNode::new("fc", 4, 2, net.random_mut());
    /// net.add_layer(fc, &["in"])?;
    /// net.add_layer(SinkNode::new("out"), &["fc"])?;
    ///
    /// net.set_input("in", Tensor::zeros((3, 4)))?;
    /// net.run_once()?;
    /// assert_eq!(net.output("out")?.dims(), &[3, 2]);
    /// # Ok::<(), vole::Error>(())
    /// ```
    pub fn add_layer<N: Node>(&mut self, node: N, inputs: &[&str]) -> Result<()> {
        let inputs = inputs.iter().map(|&p| Connection::from(p)).collect();
        self.add_boxed_layer(Box::new(node), inputs)
    }

    /// Add a layer with explicit output-slot connections.
    pub fn add_boxed_layer(&mut self, node: Box<dyn Node>, inputs: Vec<Connection>) -> Result<()> {
        self.ensure_original()?;
        self.graph.add(node, inputs)
    }

    /// Remove a layer that no other layer consumes.
    pub fn delete_layer(&mut self, name: &str) -> Result<Box<dyn Node>> {
        self.ensure_original()?;
        self.graph.remove(name)
    }

    /// Rewire input `input` of `consumer` to output `output` of `producer`.
    pub fn connect(&mut self, consumer: &str, input: usize, producer: &str, output: usize) -> Result<()> {
        self.ensure_original()?;
        self.graph
            .connect(consumer, input, Connection::new(producer, output))
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.graph.contains(name)
    }

    /// Layer names in insertion order.
    pub fn layer_names(&self) -> Vec<String> {
        self.graph.names().map(str::to_string).collect()
    }

    // Layer access

    pub fn layer(&self, name: &str) -> Result<&dyn Node> {
        self.graph.node(name)
    }

    /// Typed access to a layer.
    pub fn layer_as<T: Node>(&self, name: &str) -> Result<&T> {
        self.graph
            .node(name)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| Error::LayerTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Typed mutable access to a layer. The layer will be re-run.
    pub fn layer_as_mut<T: Node>(&mut self, name: &str) -> Result<&mut T> {
        self.graph
            .node_mut(name)?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| Error::LayerTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Set the tensor emitted by a source layer.
    pub fn set_input(&mut self, name: &str, blob: Tensor) -> Result<()> {
        self.layer_as_mut::<SourceNode>(name)?.set_blob(blob);
        Ok(())
    }

    /// Result of a layer from the last run: a sink's captured blob, or
    /// output 0 of any other layer.
    pub fn output(&self, name: &str) -> Result<Tensor> {
        let node = self.graph.node(name)?;
        let found = match node.as_any().downcast_ref::<SinkNode>() {
            Some(sink) => sink.blob().cloned(),
            None => self.graph.outputs(name)?.first().cloned(),
        };
        found.ok_or_else(|| Error::MissingBlob {
            name: name.to_string(),
        })
    }

    /// Total number of parameter elements.
    pub fn parameter_count(&self) -> usize {
        self.graph
            .nodes()
            .flat_map(|n| n.parameters())
            .map(|p| p.elem_count())
            .sum()
    }

    // Learning mode

    pub fn is_learning_enabled(&self) -> bool {
        match &self.kind {
            NetworkKind::Original { registry } => registry.is_learning_enabled(),
            NetworkKind::Reference { .. } => false,
        }
    }

    /// Learning flag once all references of an original are released.
    /// Always false for a reference network.
    pub fn settled_learning(&self) -> bool {
        match &self.kind {
            NetworkKind::Original { registry } => registry.settled_learning(),
            NetworkKind::Reference { .. } => false,
        }
    }

    /// # Panics
    ///
    /// On a reference network, and on an original with live references.
    pub fn enable_learning(&mut self) {
        match &self.kind {
            NetworkKind::Original { registry } => registry.enable_learning(),
            NetworkKind::Reference { .. } => {
                panic!("cannot enable learning on a reference network")
            }
        }
    }

    /// Always allowed; a no-op on a reference network.
    pub fn disable_learning(&mut self) {
        if let NetworkKind::Original { registry } = &self.kind {
            registry.disable_learning();
        }
    }

    // Solver

    /// The solver, if one was set or training has started.
    pub fn solver(&self) -> Option<&dyn Solver> {
        self.solver.as_deref()
    }

    pub fn solver_mut(&mut self) -> Option<&mut (dyn Solver + 'static)> {
        self.solver.as_deref_mut()
    }

    pub fn set_solver(&mut self, solver: Box<dyn Solver>) {
        self.solver = Some(solver);
    }

    // Execution

    /// Forward pass. Returns the number of layers evaluated.
    pub fn run_once(&mut self) -> Result<usize> {
        let learning = self.is_learning_enabled();
        let mut ctx = RunContext {
            engine: self.engine.as_ref(),
            random: &mut self.random,
            learning,
        };
        self.graph.forward(&mut ctx, self.config.incremental)
    }

    /// One training step: forward, backward, solver update.
    ///
    /// Fails with `Error::ReferenceNetwork` on a reference and with
    /// `Error::LearningDisabled` when learning is off; no parameter is
    /// touched in either case.
    pub fn run_and_learn_once(&mut self) -> Result<()> {
        self.ensure_original()?;
        if !self.is_learning_enabled() {
            return Err(Error::LearningDisabled);
        }

        self.graph.mark_all_dirty();
        let mut ctx = RunContext {
            engine: self.engine.as_ref(),
            random: &mut self.random,
            learning: true,
        };
        self.graph.forward(&mut ctx, false)?;
        self.graph.backward(&mut ctx)?;

        let solver = self.solver.get_or_insert_with(|| {
            log::debug!("no solver set, using SimpleGradientSolver defaults");
            Box::new(SimpleGradientSolver::default()) as Box<dyn Solver>
        });
        solver.begin_step();
        for node in self.graph.nodes().filter(|n| n.is_trainable()) {
            for (i, (param, grad)) in node
                .parameters()
                .iter()
                .zip(node.parameter_grads())
                .enumerate()
            {
                if let Some(grad) = grad {
                    let key = format!("{}/{}", node.name(), i);
                    solver.update(&key, param, &grad, self.engine.as_ref())?;
                }
            }
        }
        // Parameters changed: everything downstream of them is stale.
        self.graph.mark_all_dirty();
        Ok(())
    }

    // References

    /// Create a reference network sharing this network's parameters.
    ///
    /// Works on originals and on references (the new network then belongs to
    /// the same original). The reference gets its own random stream.
    pub fn create_reference(&self, random: Random) -> Network {
        let registry = Arc::clone(self.registry());
        let lease = ReferenceLease::acquire(registry, Arc::clone(&self.children));
        Network {
            graph: self.graph.share(),
            engine: Arc::clone(&self.engine),
            random,
            solver: None,
            kind: NetworkKind::Reference { lease },
            children: Arc::new(AtomicUsize::new(0)),
            config: self.config.clone().with_learning(false),
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        let live = self.children.load(Ordering::SeqCst);
        if live > 0 && !std::thread::panicking() {
            panic!("network dropped while {live} reference networks created from it are alive");
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("layers", &self.graph.len())
            .field("reference", &self.is_reference())
            .field("learning", &self.is_learning_enabled())
            .field("engine", &self.engine)
            .finish()
    }
}
