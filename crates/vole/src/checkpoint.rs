// Checkpoint — Save and load whole networks
//
// Binary network archive (.vole), all integers little-endian:
//
//   Header:
//     magic:     [u8; 4] = b"VOLE"
//     version:   u32     = 1
//     learning:  bool (u8)  flag as it stands with no live references
//     incremental: bool (u8)
//     seed:      u64     seed of the network's random stream
//     count:     u32     number of layers
//
//   For each layer, in execution order:
//     kind:      u8      NodeKind tag
//     name:      str     (u32 length + UTF-8)
//     inputs:    u32 count, then (producer: str, output: u32) each
//     body:      node-specific (hyper-parameters, parameter tensors)
//
//   Solver:
//     present:   bool
//     kind:      u8      SolverKind tag (if present)
//     body:      hyper-parameters + per-parameter state (if present)
//
// Layers are written in execution order, so every producer precedes its
// consumers and loading can add them one by one. A loaded network is always
// an original that owns its parameters, even if a reference was saved.
// Saving a loaded network reproduces the archive byte for byte.
//
// Usage:
//   checkpoint::save_file("model.vole", &net)?;
//   let net = checkpoint::load_file("model.vole", Arc::new(CpuEngine::new()))?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use vole_core::{ArchiveReader, ArchiveWriter, Error, MathEngine, Random, Result};
use vole_nn::{load_node, NodeKind};

use crate::graph::Connection;
use crate::network::{Network, NetworkConfig};
use crate::solver::{load_solver, SolverKind};

const MAGIC: &[u8; 4] = b"VOLE";
const VERSION: u32 = 1;

/// Write `net` to `writer`.
pub fn save<W: Write>(mut writer: W, net: &Network) -> Result<()> {
    let mut out = ArchiveWriter::new(&mut writer as &mut dyn Write);

    out.write_bytes(MAGIC)?;
    out.write_u32(VERSION)?;
    out.write_bool(net.settled_learning())?;
    out.write_bool(net.config().incremental)?;
    out.write_u64(net.random().seed())?;

    let graph = net.graph();
    let order = graph.execution_order();
    out.write_len(order.len())?;
    for name in order {
        let node = graph.node(name)?;
        out.write_u8(node.kind().tag())?;
        out.write_str(name)?;
        let inputs = graph.inputs(name)?;
        out.write_len(inputs.len())?;
        for conn in inputs {
            out.write_str(&conn.producer)?;
            out.write_len(conn.output)?;
        }
        node.save(&mut out)?;
    }

    match net.solver() {
        Some(solver) => {
            out.write_bool(true)?;
            out.write_u8(solver.kind().tag())?;
            solver.save(&mut out)?;
        }
        None => out.write_bool(false)?,
    }
    out.flush()?;

    log::debug!(
        "saved network: {} layers, {} parameters",
        graph.len(),
        net.parameter_count()
    );
    Ok(())
}

/// Read a network written by [`save`]. The result is an original network
/// computing on `engine`.
pub fn load<R: Read>(mut reader: R, engine: Arc<dyn MathEngine>) -> Result<Network> {
    let mut input = ArchiveReader::new(&mut reader as &mut dyn Read);

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::archive("invalid magic bytes, not a vole network"));
    }
    let version = input.read_u32()?;
    if version != VERSION {
        return Err(Error::archive(format!(
            "unsupported archive version {version} (expected {VERSION})"
        )));
    }

    let config = NetworkConfig::default()
        .with_learning(input.read_bool()?)
        .with_incremental(input.read_bool()?);
    let seed = input.read_u64()?;
    let mut net = Network::with_config(engine, Random::new(seed), config);

    let count = input.read_len()?;
    for _ in 0..count {
        let kind = NodeKind::from_tag(input.read_u8()?)?;
        let name = input.read_string()?;
        let input_count = input.read_len()?;
        let mut inputs = Vec::with_capacity(input_count.min(64));
        for _ in 0..input_count {
            let producer = input.read_string()?;
            let output = input.read_len()?;
            inputs.push(Connection::new(producer, output));
        }
        let node = load_node(kind, &name, &mut input)?;
        net.add_boxed_layer(node, inputs)?;
    }

    if input.read_bool()? {
        let kind = SolverKind::from_tag(input.read_u8()?)?;
        net.set_solver(load_solver(kind, &mut input)?);
    }

    log::debug!("loaded network: {count} layers");
    Ok(net)
}

/// Save `net` to a file.
pub fn save_file(path: impl AsRef<Path>, net: &Network) -> Result<()> {
    let file = File::create(path.as_ref())?;
    save(BufWriter::new(file), net)
}

/// Load a network from a file.
pub fn load_file(path: impl AsRef<Path>, engine: Arc<dyn MathEngine>) -> Result<Network> {
    let file = File::open(path.as_ref())?;
    load(BufReader::new(file), engine)
}

/// Save `net` into a byte vector.
pub fn to_bytes(net: &Network) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    save(&mut bytes, net)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::CpuEngine;
    use vole_nn::{ActivationNode, FullyConnectedNode, SinkNode, SourceNode};

    fn engine() -> Arc<dyn MathEngine> {
        Arc::new(CpuEngine::new())
    }

    #[test]
    fn test_header_is_checked() {
        let mut bytes = b"SHRW".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(load(&bytes[..], engine()), Err(Error::Archive(_))));

        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        assert!(matches!(load(&bytes[..], engine()), Err(Error::Archive(_))));

        assert!(matches!(load(&MAGIC[..2], engine()), Err(Error::Archive(_))));
    }

    #[test]
    fn test_layers_saved_in_execution_order() {
        let mut net = Network::new(engine(), Random::new(3));
        net.add_layer(SourceNode::new("in"), &[]).unwrap();
        net.add_layer(ActivationNode::relu("a"), &["in"]).unwrap();
        net.add_layer(ActivationNode::tanh("b"), &["in"]).unwrap();
        net.add_layer(SinkNode::new("out"), &["a"]).unwrap();
        // a now runs after b
        net.connect("a", 0, "b", 0).unwrap();

        let loaded = load(&to_bytes(&net).unwrap()[..], engine()).unwrap();
        assert_eq!(loaded.layer_names(), vec!["in", "b", "a", "out"]);
        assert_eq!(loaded.graph().inputs("a").unwrap()[0].producer, "b");
        assert_eq!(loaded.random().seed(), 3);
    }

    #[test]
    fn test_truncated_body_fails() {
        let mut net = Network::new(engine(), Random::new(0));
        net.add_layer(SourceNode::new("in"), &[]).unwrap();
        let fc = FullyConnectedNode::new("fc", 8, 8, net.random_mut());
        net.add_layer(fc, &["in"]).unwrap();
        let bytes = to_bytes(&net).unwrap();
        let cut = &bytes[..bytes.len() - 10];
        assert!(matches!(load(cut, engine()), Err(Error::Archive(_))));
    }
}
