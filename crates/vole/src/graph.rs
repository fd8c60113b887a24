// Graph — named nodes, their wiring, and their last outputs
//
// Nodes are kept in insertion order; a name index maps layer names to
// positions. Every node input is a `Connection` to one output slot of a
// producer in the same graph. The graph is kept valid at all times:
//
//   - names are unique
//   - every connection resolves to an existing producer and output slot
//   - each node has exactly `input_count()` connections
//   - there are no cycles
//
// EXECUTION:
//
//   forward() walks the nodes in topological order (Kahn's algorithm, ties
//   broken by insertion order, so the order is deterministic). With
//   incremental execution a node is only re-run if it is dirty, if one of
//   its producers was re-run in this pass, or if it is stochastic while
//   learning. Stochastic nodes are also re-run when the learning flag
//   differs from the previous pass. Outputs are freshly allocated on every
//   run.
//
//   backward() walks the same order in reverse. Gradients flowing into one
//   output slot from several consumers are summed.

use std::collections::{BTreeSet, HashMap};

use vole_core::{BinaryOp, Error, Result, Tensor};
use vole_nn::{Node, RunContext};

/// One input of a node: output slot `output` of layer `producer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub producer: String,
    pub output: usize,
}

impl Connection {
    pub fn new(producer: impl Into<String>, output: usize) -> Self {
        Connection {
            producer: producer.into(),
            output,
        }
    }
}

impl From<&str> for Connection {
    fn from(producer: &str) -> Self {
        Connection::new(producer, 0)
    }
}

impl From<(&str, usize)> for Connection {
    fn from((producer, output): (&str, usize)) -> Self {
        Connection::new(producer, output)
    }
}

struct NodeSlot {
    node: Box<dyn Node>,
    inputs: Vec<Connection>,
    outputs: Vec<Tensor>,
    dirty: bool,
}

/// A validated directed acyclic graph of layers.
#[derive(Default)]
pub struct Graph {
    slots: Vec<NodeSlot>,
    index: HashMap<String, usize>,
    /// Learning flag of the last forward pass; `None` before the first one.
    last_learning: Option<bool>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Layer names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.node.name())
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &dyn Node> {
        self.slots.iter().map(|s| s.node.as_ref())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::LayerNotFound {
                name: name.to_string(),
            })
    }

    /// Check that `conn` resolves, on behalf of `consumer`.
    fn check_connection(&self, consumer: &str, conn: &Connection) -> Result<()> {
        let Some(&p) = self.index.get(&conn.producer) else {
            return Err(Error::DanglingConnection {
                consumer: consumer.to_string(),
                producer: conn.producer.clone(),
            });
        };
        let count = self.slots[p].node.output_count();
        if conn.output >= count {
            return Err(Error::OutputOutOfRange {
                producer: conn.producer.clone(),
                output: conn.output,
                count,
            });
        }
        Ok(())
    }

    /// Add a node wired to existing producers.
    pub fn add(&mut self, node: Box<dyn Node>, inputs: Vec<Connection>) -> Result<()> {
        let name = node.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicateLayer { name });
        }
        if inputs.len() != node.input_count() {
            return Err(Error::InputCountMismatch {
                layer: name,
                expected: node.input_count(),
                got: inputs.len(),
            });
        }
        for conn in &inputs {
            self.check_connection(&name, conn)?;
        }
        self.index.insert(name, self.slots.len());
        self.slots.push(NodeSlot {
            node,
            inputs,
            outputs: Vec::new(),
            dirty: true,
        });
        Ok(())
    }

    /// Remove a node that no other node consumes.
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Node>> {
        let pos = self.position(name)?;
        if let Some(consumer) = self
            .slots
            .iter()
            .find(|s| s.inputs.iter().any(|c| c.producer == name))
        {
            return Err(Error::LayerInUse {
                name: name.to_string(),
                consumer: consumer.node.name().to_string(),
            });
        }
        let slot = self.slots.remove(pos);
        self.rebuild_index();
        Ok(slot.node)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.node.name().to_string(), i))
            .collect();
    }

    /// Rewire input `input` of `consumer` to `conn`.
    pub fn connect(&mut self, consumer: &str, input: usize, conn: Connection) -> Result<()> {
        let c = self.position(consumer)?;
        let expected = self.slots[c].node.input_count();
        if input >= expected {
            return Err(Error::InputCountMismatch {
                layer: consumer.to_string(),
                expected,
                got: input + 1,
            });
        }
        self.check_connection(consumer, &conn)?;
        if self.depends_on(&conn.producer, consumer) {
            return Err(Error::Cycle {
                producer: conn.producer,
                consumer: consumer.to_string(),
            });
        }
        let slot = &mut self.slots[c];
        slot.inputs[input] = conn;
        slot.dirty = true;
        Ok(())
    }

    /// Whether `node` is `ancestor` or transitively consumes it.
    fn depends_on(&self, node: &str, ancestor: &str) -> bool {
        let mut stack = vec![node];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(&i) = self.index.get(current) {
                stack.extend(self.slots[i].inputs.iter().map(|c| c.producer.as_str()));
            }
        }
        false
    }

    pub fn node(&self, name: &str) -> Result<&dyn Node> {
        let i = self.position(name)?;
        Ok(self.slots[i].node.as_ref())
    }

    /// Mutable access to a node. The node is marked dirty.
    pub fn node_mut(&mut self, name: &str) -> Result<&mut dyn Node> {
        let i = self.position(name)?;
        let slot = &mut self.slots[i];
        slot.dirty = true;
        Ok(slot.node.as_mut())
    }

    pub fn inputs(&self, name: &str) -> Result<&[Connection]> {
        let i = self.position(name)?;
        Ok(&self.slots[i].inputs)
    }

    /// Outputs of the last forward pass (empty before the first run).
    pub fn outputs(&self, name: &str) -> Result<&[Tensor]> {
        let i = self.position(name)?;
        Ok(&self.slots[i].outputs)
    }

    pub fn is_dirty(&self, name: &str) -> Result<bool> {
        let i = self.position(name)?;
        Ok(self.slots[i].dirty)
    }

    pub fn mark_all_dirty(&mut self) {
        for slot in &mut self.slots {
            slot.dirty = true;
        }
    }

    /// Node positions in execution order.
    pub(crate) fn topo_order(&self) -> Vec<usize> {
        let n = self.slots.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, slot) in self.slots.iter().enumerate() {
            for conn in &slot.inputs {
                if let Some(&p) = self.index.get(&conn.producer) {
                    in_degree[i] += 1;
                    consumers[p].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &c in &consumers[i] {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.insert(c);
                }
            }
        }
        order
    }

    /// Layer names in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.topo_order()
            .into_iter()
            .map(|i| self.slots[i].node.name())
            .collect()
    }

    fn gather_inputs(&self, i: usize) -> Result<Vec<Tensor>> {
        let slot = &self.slots[i];
        slot.inputs
            .iter()
            .map(|conn| {
                let p = self.position(&conn.producer)?;
                self.slots[p].outputs.get(conn.output).cloned().ok_or_else(|| {
                    Error::msg(format!(
                        "layer '{}' has not produced output #{} for '{}'",
                        conn.producer,
                        conn.output,
                        slot.node.name()
                    ))
                })
            })
            .collect()
    }

    /// Run the forward pass. Returns the number of nodes evaluated.
    pub(crate) fn forward(&mut self, ctx: &mut RunContext<'_>, incremental: bool) -> Result<usize> {
        let order = self.topo_order();
        let mut evaluated = vec![false; self.slots.len()];
        let mut count = 0;

        // Stochastic outputs from a pass in the other mode are stale.
        if self.last_learning != Some(ctx.learning) {
            for slot in self.slots.iter_mut().filter(|s| s.node.is_stochastic()) {
                slot.dirty = true;
            }
            self.last_learning = Some(ctx.learning);
        }

        for &i in &order {
            let needs_run = {
                let slot = &self.slots[i];
                !incremental
                    || slot.dirty
                    || (ctx.learning && slot.node.is_stochastic())
                    || slot.inputs.iter().any(|c| {
                        self.index
                            .get(&c.producer)
                            .is_some_and(|&p| evaluated[p])
                    })
            };
            if !needs_run {
                continue;
            }

            let inputs = self.gather_inputs(i)?;
            let slot = &mut self.slots[i];
            log::trace!("forward {} '{}'", slot.node.kind(), slot.node.name());
            let outputs = slot.node.forward(&inputs, ctx)?;
            if outputs.len() != slot.node.output_count() {
                return Err(Error::msg(format!(
                    "layer '{}' produced {} outputs, declared {}",
                    slot.node.name(),
                    outputs.len(),
                    slot.node.output_count()
                )));
            }
            slot.outputs = outputs;
            slot.dirty = false;
            evaluated[i] = true;
            count += 1;
        }
        Ok(count)
    }

    /// Run the backward pass over the outputs of the last forward pass.
    pub(crate) fn backward(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let order = self.topo_order();
        let mut diffs: Vec<Vec<Option<Tensor>>> = self
            .slots
            .iter()
            .map(|s| vec![None; s.node.output_count()])
            .collect();

        for &i in order.iter().rev() {
            let inputs = self.gather_inputs(i)?;
            let output_diffs = std::mem::take(&mut diffs[i]);
            let slot = &mut self.slots[i];
            log::trace!("backward {} '{}'", slot.node.kind(), slot.node.name());
            let input_diffs = slot
                .node
                .backward(&inputs, &slot.outputs, &output_diffs, ctx)?;

            for (conn, diff) in slot.inputs.iter().zip(input_diffs) {
                let Some(diff) = diff else { continue };
                let Some(&p) = self.index.get(&conn.producer) else {
                    continue;
                };
                let target = &mut diffs[p][conn.output];
                *target = Some(match target.take() {
                    Some(existing) => ctx.engine.binary(BinaryOp::Add, &existing, &diff)?,
                    None => diff,
                });
            }
        }
        Ok(())
    }

    /// Structural copy for a reference network: same names and wiring,
    /// nodes from `Node::share`, no outputs, everything dirty.
    pub(crate) fn share(&self) -> Graph {
        Graph {
            slots: self
                .slots
                .iter()
                .map(|s| NodeSlot {
                    node: s.node.share(),
                    inputs: s.inputs.clone(),
                    outputs: Vec::new(),
                    dirty: true,
                })
                .collect(),
            index: self.index.clone(),
            last_learning: None,
        }
    }
}
