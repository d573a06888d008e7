use std::collections::BTreeMap;
use std::sync::OnceLock;

use autopar::Program;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Global access point for subgraph logging.
///
/// Use `graph_logger()` rather than accessing this directly.
static GRAPH_LOGGER: OnceLock<GraphLogger> = OnceLock::new();

/// Get the global graph logger, initializing it on first use.
pub fn graph_logger() -> &'static GraphLogger {
    GRAPH_LOGGER.get_or_init(GraphLogger::new)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphLogConfig {
    /// Master on/off switch.
    pub enabled: bool,
    /// Record the op type of every op, not only counts.
    pub op_types: bool,
}

/// Summary of one materialized subgraph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubgraphRecord {
    pub num_blocks: usize,
    pub num_ops: usize,
    pub op_types: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphLogSession {
    pub config: GraphLogConfig,
    pub subgraphs: Vec<SubgraphRecord>,
}

impl GraphLogSession {
    pub fn total_ops(&self) -> usize {
        self.subgraphs.iter().map(|s| s.num_ops).sum()
    }

    /// Op counts by type over all recorded subgraphs.
    pub fn op_histogram(&self) -> BTreeMap<String, usize> {
        let mut histogram = BTreeMap::new();
        for ty in self.subgraphs.iter().flat_map(|s| s.op_types.iter().flatten()) {
            *histogram.entry(ty.clone()).or_insert(0) += 1;
        }
        histogram
    }
}

/// Collects the subgraphs compiled traces materialize.
#[derive(Debug, Default)]
pub struct GraphLogger {
    inner: RwLock<Option<GraphLogSession>>,
}

impl GraphLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session, replacing any existing one.
    pub fn start(&self, config: GraphLogConfig) {
        let mut guard = self.inner.write();
        *guard = config.enabled.then(|| GraphLogSession {
            config,
            subgraphs: Vec::new(),
        });
    }

    /// Stop the current session and return it, if any.
    pub fn stop(&self) -> Option<GraphLogSession> {
        self.inner.write().take()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn add_subgraph(&self, program: &Program) {
        let mut guard = self.inner.write();
        let Some(session) = guard.as_mut() else {
            return;
        };
        let num_ops = program.blocks().iter().map(|b| b.num_ops()).sum();
        let op_types = session.config.op_types.then(|| {
            program
                .blocks()
                .iter()
                .flat_map(|b| b.ops().iter().map(|op| op.op_type().to_string()))
                .collect()
        });
        log::trace!("Logged subgraph with {num_ops} ops");
        session.subgraphs.push(SubgraphRecord {
            num_blocks: program.num_blocks(),
            num_ops,
            op_types,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopar::OpDesc;

    #[test]
    fn records_only_while_enabled() {
        let logger = GraphLogger::new();
        let mut program = Program::new();
        program.global_block_mut().append_op(OpDesc::new("assign"));
        program.global_block_mut().append_op(OpDesc::new("assign"));

        logger.add_subgraph(&program);
        assert!(!logger.is_enabled());

        logger.start(GraphLogConfig {
            enabled: true,
            op_types: true,
        });
        logger.add_subgraph(&program);
        logger.add_subgraph(&program);
        let session = logger.stop().unwrap();
        assert_eq!(session.subgraphs.len(), 2);
        assert_eq!(session.total_ops(), 4);
        assert_eq!(session.op_histogram()["assign"], 4);
        assert!(logger.stop().is_none());
    }
}
