use std::collections::{BTreeMap, BTreeSet};

use crate::{InvariantError, OpDesc, OpId, VarDesc};

pub type BlockId = usize;

/// Which ops read and which ops write each var name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct UsageIndex {
    readers: BTreeMap<String, BTreeSet<OpId>>,
    writers: BTreeMap<String, BTreeSet<OpId>>,
}

impl UsageIndex {
    fn add(&mut self, op: &OpDesc) {
        for name in op.input_arg_names() {
            self.readers.entry(name.to_string()).or_default().insert(op.id());
        }
        for name in op.output_arg_names() {
            self.writers.entry(name.to_string()).or_default().insert(op.id());
        }
    }

    fn remove(&mut self, op: &OpDesc) {
        fn drop_from(map: &mut BTreeMap<String, BTreeSet<OpId>>, name: &str, id: OpId) {
            if let Some(set) = map.get_mut(name) {
                set.remove(&id);
                if set.is_empty() {
                    map.remove(name);
                }
            }
        }
        for name in op.input_arg_names() {
            drop_from(&mut self.readers, name, op.id());
        }
        for name in op.output_arg_names() {
            drop_from(&mut self.writers, name, op.id());
        }
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        self.readers.keys().chain(self.writers.keys())
    }
}

/// An ordered sequence of ops plus the vars declared in its scope.
#[derive(Debug, Clone)]
pub struct Block {
    idx: BlockId,
    parent: Option<BlockId>,
    vars: BTreeMap<String, VarDesc>,
    ops: Vec<OpDesc>,
    index: UsageIndex,
}

impl Block {
    pub(crate) fn new(idx: BlockId, parent: Option<BlockId>) -> Self {
        Self {
            idx,
            parent,
            vars: BTreeMap::new(),
            ops: Vec::new(),
            index: UsageIndex::default(),
        }
    }

    pub fn idx(&self) -> BlockId {
        self.idx
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarDesc> {
        self.vars.values()
    }

    pub fn var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.get(name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut VarDesc> {
        self.vars.get_mut(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Declares a var in this block. Names are unique within a block.
    pub fn create_var(&mut self, var: VarDesc) -> Result<&mut VarDesc, InvariantError> {
        use std::collections::btree_map::Entry;
        match self.vars.entry(var.name().to_string()) {
            Entry::Occupied(_) => Err(InvariantError::DuplicateVar {
                name: var.name().to_string(),
                block: self.idx,
            }),
            Entry::Vacant(entry) => {
                log::trace!("Block {}: create var {}", self.idx, var.name());
                Ok(entry.insert(var))
            }
        }
    }

    pub fn remove_var(&mut self, name: &str) -> Option<VarDesc> {
        self.vars.remove(name)
    }

    pub fn ops(&self) -> &[OpDesc] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&self, index: usize) -> Option<&OpDesc> {
        self.ops.get(index)
    }

    /// Mutable access for attribute and role updates. Argument renames go through
    /// [`Block::rename_input`] and [`Block::rename_output`].
    pub fn op_mut(&mut self, index: usize) -> Option<&mut OpDesc> {
        self.ops.get_mut(index)
    }

    pub fn find_op(&self, id: OpId) -> Option<usize> {
        self.ops.iter().position(|op| op.id() == id)
    }

    pub fn append_op(&mut self, op: OpDesc) -> OpId {
        let id = op.id();
        self.index.add(&op);
        self.ops.push(op);
        id
    }

    /// Inserts `op` so that it ends up at `index`. `index == num_ops()` appends.
    pub fn insert_op(&mut self, index: usize, op: OpDesc) -> Result<OpId, InvariantError> {
        if index > self.ops.len() {
            return Err(InvariantError::OpIndexOutOfRange {
                index,
                len: self.ops.len(),
                block: self.idx,
            });
        }
        let id = op.id();
        self.index.add(&op);
        self.ops.insert(index, op);
        Ok(id)
    }

    /// Removes the op at `index`, keeping the relative order of the rest.
    pub fn remove_op(&mut self, index: usize) -> Result<OpDesc, InvariantError> {
        if index >= self.ops.len() {
            return Err(InvariantError::OpIndexOutOfRange {
                index,
                len: self.ops.len(),
                block: self.idx,
            });
        }
        let op = self.ops.remove(index);
        self.index.remove(&op);
        Ok(op)
    }

    pub fn rename_input(&mut self, index: usize, old: &str, new: &str) -> Result<(), InvariantError> {
        self.rename_arg(index, old, new, "input")
    }

    pub fn rename_output(&mut self, index: usize, old: &str, new: &str) -> Result<(), InvariantError> {
        self.rename_arg(index, old, new, "output")
    }

    fn rename_arg(
        &mut self,
        index: usize,
        old: &str,
        new: &str,
        direction: &'static str,
    ) -> Result<(), InvariantError> {
        let len = self.ops.len();
        let op = self
            .ops
            .get_mut(index)
            .ok_or(InvariantError::OpIndexOutOfRange {
                index,
                len,
                block: self.idx,
            })?;
        self.index.remove(op);
        let found = match direction {
            "input" => op.rename_input_arg(old, new),
            _ => op.rename_output_arg(old, new),
        };
        self.index.add(op);
        if !found {
            return Err(InvariantError::ArgumentNotFound {
                op: op.id(),
                name: old.to_string(),
                direction,
            });
        }
        log::trace!("Block {}: op {} {direction} {old} -> {new}", self.idx, op.op_type());
        Ok(())
    }

    /// Indices of the ops reading `name`, in program order.
    pub fn readers_of(&self, name: &str) -> Vec<usize> {
        self.positions_of(self.index.readers.get(name))
    }

    /// Indices of the ops writing `name`, in program order.
    pub fn writers_of(&self, name: &str) -> Vec<usize> {
        self.positions_of(self.index.writers.get(name))
    }

    fn positions_of(&self, ids: Option<&BTreeSet<OpId>>) -> Vec<usize> {
        let Some(ids) = ids else {
            return Vec::new();
        };
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, op)| ids.contains(&op.id()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Checks that the usage index agrees with the op list.
    pub fn verify_index(&self) -> Result<(), InvariantError> {
        let mut expected = UsageIndex::default();
        self.ops.iter().for_each(|op| expected.add(op));
        if expected == self.index {
            return Ok(());
        }
        let name = expected
            .names()
            .chain(self.index.names())
            .find(|name| {
                expected.readers.get(*name) != self.index.readers.get(*name)
                    || expected.writers.get(*name) != self.index.writers.get(*name)
            })
            .cloned()
            .unwrap_or_default();
        Err(InvariantError::StaleIndex {
            name,
            block: self.idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape, DType};

    fn block_with_chain() -> Block {
        let mut block = Block::new(0, None);
        for name in ["a", "b", "c"] {
            block
                .create_var(VarDesc::new(name, shape![2], DType::F32))
                .unwrap();
        }
        block.append_op(OpDesc::new("assign").with_input("X", ["a"]).with_output("Out", ["b"]));
        block.append_op(OpDesc::new("scale").with_input("X", ["b"]).with_output("Out", ["c"]));
        block
    }

    #[test]
    fn duplicate_var_is_rejected() {
        let mut block = block_with_chain();
        let err = block
            .create_var(VarDesc::new("a", shape![2], DType::F32))
            .unwrap_err();
        assert!(matches!(err, InvariantError::DuplicateVar { .. }));
    }

    #[test]
    fn index_follows_insert_remove_and_rename() {
        let mut block = block_with_chain();
        assert_eq!(block.readers_of("b"), vec![1]);
        assert_eq!(block.writers_of("b"), vec![0]);

        block
            .insert_op(1, OpDesc::new("assign").with_input("X", ["b"]).with_output("Out", ["a"]))
            .unwrap();
        assert_eq!(block.readers_of("b"), vec![1, 2]);

        block.rename_input(2, "b", "a").unwrap();
        assert_eq!(block.readers_of("b"), vec![1]);
        assert_eq!(block.readers_of("a"), vec![0, 2]);

        let removed = block.remove_op(1).unwrap();
        assert_eq!(removed.op_type(), "assign");
        assert!(block.readers_of("b").is_empty());
        block.verify_index().unwrap();
    }

    #[test]
    fn renaming_a_missing_argument_fails() {
        let mut block = block_with_chain();
        let err = block.rename_output(0, "zzz", "a").unwrap_err();
        assert!(matches!(err, InvariantError::ArgumentNotFound { .. }));
        block.verify_index().unwrap();
    }

    #[test]
    fn insert_out_of_range() {
        let mut block = block_with_chain();
        assert!(block.insert_op(5, OpDesc::new("assign")).is_err());
        assert!(block.remove_op(2).is_err());
    }
}
