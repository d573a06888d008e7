use std::collections::BTreeMap;

use derive_new::new;
use serde::{Deserialize, Serialize};

/// A logical grid of processes.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessMesh {
    shape: Vec<i64>,
    process_ids: Vec<i64>,
    dim_names: Vec<String>,
}

impl ProcessMesh {
    /// A one-dimensional mesh over the given ranks.
    pub fn from_ranks(ranks: &[i64]) -> Self {
        Self {
            shape: vec![ranks.len() as i64],
            process_ids: ranks.to_vec(),
            dim_names: vec!["d0".to_string()],
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn process_ids(&self) -> &[i64] {
        &self.process_ids
    }

    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.process_ids.is_empty()
    }
}

/// Distributed attribute of a tensor: which mesh it lives on, how each tensor dimension maps
/// onto a mesh dimension (`-1` is replicated) and the pipeline chunk it belongs to.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorDistAttr {
    pub process_mesh: ProcessMesh,
    pub dims_mapping: Vec<i64>,
    pub chunk_id: i64,
}

impl TensorDistAttr {
    pub fn replicated(process_mesh: ProcessMesh, rank: usize) -> Self {
        Self::new(process_mesh, vec![-1; rank], 0)
    }

    pub fn is_replicated(&self) -> bool {
        self.dims_mapping.iter().all(|d| *d == -1)
    }
}

/// Distributed attribute of an imperative op. Dims mappings are keyed by var name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpDistAttr {
    pub process_mesh: ProcessMesh,
    input_dims_mappings: BTreeMap<String, Vec<i64>>,
    output_dims_mappings: BTreeMap<String, Vec<i64>>,
    pub chunk_id: i64,
    pub impl_type: String,
    pub impl_idx: usize,
}

impl OpDistAttr {
    pub fn new(process_mesh: ProcessMesh, chunk_id: i64) -> Self {
        Self {
            process_mesh,
            chunk_id,
            impl_type: "default".to_string(),
            ..Default::default()
        }
    }

    pub fn input_dims_mapping(&self, name: &str) -> Option<&[i64]> {
        self.input_dims_mappings.get(name).map(Vec::as_slice)
    }

    pub fn output_dims_mapping(&self, name: &str) -> Option<&[i64]> {
        self.output_dims_mappings.get(name).map(Vec::as_slice)
    }

    pub fn set_input_dims_mapping(&mut self, name: &str, mapping: Vec<i64>) {
        self.input_dims_mappings.insert(name.to_string(), mapping);
    }

    pub fn set_output_dims_mapping(&mut self, name: &str, mapping: Vec<i64>) {
        self.output_dims_mappings.insert(name.to_string(), mapping);
    }

    pub fn input_dims_mappings(&self) -> impl Iterator<Item = (&str, &[i64])> {
        self.input_dims_mappings
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn output_dims_mappings(&self) -> impl Iterator<Item = (&str, &[i64])> {
        self.output_dims_mappings
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Moves the input mapping recorded for `old` to `new`.
    pub fn rename_input(&mut self, old: &str, new: &str) {
        if let Some(mapping) = self.input_dims_mappings.remove(old) {
            self.input_dims_mappings.insert(new.to_string(), mapping);
        }
    }

    /// Moves the output mapping recorded for `old` to `new`.
    pub fn rename_output(&mut self, old: &str, new: &str) {
        if let Some(mapping) = self.output_dims_mappings.remove(old) {
            self.output_dims_mappings.insert(new.to_string(), mapping);
        }
    }
}

/// Distributed attribute of a value-graph operation, positional over operands and results.
#[derive(new, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PirOpDistAttr {
    pub process_mesh: ProcessMesh,
    pub operands: Vec<TensorDistAttr>,
    pub results: Vec<TensorDistAttr>,
    pub chunk_id: i64,
}
