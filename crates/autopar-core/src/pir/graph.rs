//! Value-graph representation.

use std::collections::BTreeMap;

use slotmap::{new_key_type, SlotMap};

use crate::{
    Attribute, DType, HashSet, InvariantError, OpRole, PirOpDistAttr, RVec, Shape,
    TensorDistAttr, VarKind,
};

new_key_type! {
    /// Unique identifier for a value in the graph.
    pub struct ValueId;
}

new_key_type! {
    /// Unique identifier for an operation in the graph.
    pub struct OperationId;
}

/// Where a value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueDef {
    /// The `index`-th result of `op`.
    OpResult { op: OperationId, index: usize },
    /// A named argument of the top-level block.
    BlockArg { name: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueType {
    pub shape: Shape,
    pub dtype: DType,
    pub kind: VarKind,
    pub dist_attr: Option<TensorDistAttr>,
}

impl ValueType {
    pub fn dense(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            kind: VarKind::Dense,
            dist_attr: None,
        }
    }

    pub fn with_dist_attr(mut self, dist_attr: TensorDistAttr) -> Self {
        self.dist_attr = Some(dist_attr);
        self
    }
}

/// One use of a value: operand `operand` of `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub op: OperationId,
    pub operand: usize,
}

#[derive(Debug, Clone)]
pub struct Value {
    def: ValueDef,
    ty: ValueType,
    persistable: bool,
    /// Consumers of this value, in the order they were attached.
    uses: RVec<Use>,
}

impl Value {
    pub fn def(&self) -> &ValueDef {
        &self.def
    }

    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    pub fn set_ty(&mut self, ty: ValueType) {
        self.ty = ty;
    }

    pub fn persistable(&self) -> bool {
        self.persistable
    }

    pub fn set_persistable(&mut self, persistable: bool) {
        self.persistable = persistable;
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn num_uses(&self) -> usize {
        self.uses.len()
    }

    pub fn is_block_arg(&self) -> bool {
        matches!(self.def, ValueDef::BlockArg { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match &self.def {
            ValueDef::BlockArg { name } => Some(name),
            ValueDef::OpResult { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    name: String,
    operands: RVec<ValueId>,
    results: RVec<ValueId>,
    role: OpRole,
    attrs: BTreeMap<String, Attribute>,
    dist_attr: Option<PirOpDistAttr>,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<ValueId> {
        self.operands.get(index).copied()
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    pub fn result(&self, index: usize) -> Option<ValueId> {
        self.results.get(index).copied()
    }

    pub fn role(&self) -> OpRole {
        self.role
    }

    pub fn set_role(&mut self, role: OpRole) {
        self.role = role;
    }

    pub fn attrs(&self) -> &BTreeMap<String, Attribute> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&Attribute> {
        self.attrs.get(key)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<Attribute>) {
        self.attrs.insert(key.to_string(), value.into());
    }

    pub fn dist_attr(&self) -> Option<&PirOpDistAttr> {
        self.dist_attr.as_ref()
    }

    pub fn set_dist_attr(&mut self, dist_attr: Option<PirOpDistAttr>) {
        self.dist_attr = dist_attr;
    }
}

/// Position at which a new operation is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Before(OperationId),
    After(OperationId),
    BlockStart,
    BlockEnd,
}

/// A single-block program in value-graph form.
///
/// Operations live in slot maps and are ordered by `order`. Every value tracks its uses, so
/// consumers are found by walking the uses of a value rather than by name.
#[derive(Debug, Default, Clone)]
pub struct PirProgram {
    values: SlotMap<ValueId, Value>,
    ops: SlotMap<OperationId, Operation>,
    order: Vec<OperationId>,
    kwargs: BTreeMap<String, ValueId>,
}

impl PirProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named block argument. Argument names are unique.
    pub fn add_kwarg(&mut self, name: &str, ty: ValueType) -> Result<ValueId, InvariantError> {
        if self.kwargs.contains_key(name) {
            return Err(InvariantError::DuplicateVar {
                name: name.to_string(),
                block: 0,
            });
        }
        let id = self.values.insert(Value {
            def: ValueDef::BlockArg {
                name: name.to_string(),
            },
            ty,
            persistable: false,
            uses: RVec::new(),
        });
        self.kwargs.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn kwarg(&self, name: &str) -> Option<ValueId> {
        self.kwargs.get(name).copied()
    }

    pub fn kwargs(&self) -> impl Iterator<Item = (&str, ValueId)> {
        self.kwargs.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn value(&self, id: ValueId) -> Result<&Value, InvariantError> {
        self.values
            .get(id)
            .ok_or_else(|| InvariantError::ValueNotFound(format!("{id:?}")))
    }

    pub fn value_mut(&mut self, id: ValueId) -> Result<&mut Value, InvariantError> {
        self.values
            .get_mut(id)
            .ok_or_else(|| InvariantError::ValueNotFound(format!("{id:?}")))
    }

    pub fn op(&self, id: OperationId) -> Result<&Operation, InvariantError> {
        self.ops
            .get(id)
            .ok_or_else(|| InvariantError::OperationNotFound(format!("{id:?}")))
    }

    pub fn op_mut(&mut self, id: OperationId) -> Result<&mut Operation, InvariantError> {
        self.ops
            .get_mut(id)
            .ok_or_else(|| InvariantError::OperationNotFound(format!("{id:?}")))
    }

    /// Operations in program order.
    pub fn ops(&self) -> impl DoubleEndedIterator<Item = OperationId> + '_ {
        self.order.iter().copied()
    }

    pub fn num_ops(&self) -> usize {
        self.order.len()
    }

    pub fn position(&self, op: OperationId) -> Option<usize> {
        self.order.iter().position(|o| *o == op)
    }

    pub fn prev_op(&self, op: OperationId) -> Option<OperationId> {
        let pos = self.position(op)?;
        pos.checked_sub(1).map(|p| self.order[p])
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OperationId> {
        match &self.values.get(value)?.def {
            ValueDef::OpResult { op, .. } => Some(*op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Inserts an operation at `at`, wiring `operands` and creating one result per entry of
    /// `result_types`. The new operation has forward role and no attributes.
    pub fn insert_op(
        &mut self,
        at: InsertionPoint,
        name: &str,
        operands: &[ValueId],
        result_types: Vec<ValueType>,
    ) -> Result<OperationId, InvariantError> {
        for operand in operands {
            self.value(*operand)?;
        }
        let pos = match at {
            InsertionPoint::Before(op) => self.checked_position(op)?,
            InsertionPoint::After(op) => self.checked_position(op)? + 1,
            InsertionPoint::BlockStart => 0,
            InsertionPoint::BlockEnd => self.order.len(),
        };

        let id = self.ops.insert(Operation {
            name: name.to_string(),
            operands: operands.iter().copied().collect(),
            results: RVec::new(),
            role: OpRole::FORWARD,
            attrs: BTreeMap::new(),
            dist_attr: None,
        });
        for (index, operand) in operands.iter().enumerate() {
            self.values[*operand].uses.push(Use { op: id, operand: index });
        }
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.values.insert(Value {
                    def: ValueDef::OpResult { op: id, index },
                    ty,
                    persistable: false,
                    uses: RVec::new(),
                })
            })
            .collect();
        self.ops[id].results = results;
        self.order.insert(pos, id);
        log::trace!("Inserted {name} at {pos}");
        Ok(id)
    }

    pub fn append_op(
        &mut self,
        name: &str,
        operands: &[ValueId],
        result_types: Vec<ValueType>,
    ) -> Result<OperationId, InvariantError> {
        self.insert_op(InsertionPoint::BlockEnd, name, operands, result_types)
    }

    fn checked_position(&self, op: OperationId) -> Result<usize, InvariantError> {
        self.position(op)
            .ok_or_else(|| InvariantError::OperationNotFound(format!("{op:?}")))
    }

    /// Removes an operation whose results are unused.
    pub fn erase_op(&mut self, id: OperationId) -> Result<Operation, InvariantError> {
        let op = self.op(id)?;
        for result in op.results() {
            let uses = self.values[*result].uses.len();
            if uses > 0 {
                return Err(InvariantError::ValueStillUsed {
                    op: format!("{} ({id:?})", op.name()),
                    value: format!("{result:?}"),
                    uses,
                });
            }
        }
        let op = self
            .ops
            .remove(id)
            .ok_or_else(|| InvariantError::OperationNotFound(format!("{id:?}")))?;
        for operand in op.operands() {
            if let Some(value) = self.values.get_mut(*operand) {
                value.uses.retain(|u| u.op != id);
            }
        }
        for result in op.results() {
            self.values.remove(*result);
        }
        self.order.retain(|o| *o != id);
        Ok(op)
    }

    /// Distinct consumers of `value` in program order.
    pub fn all_used_ops(&self, value: ValueId) -> Vec<OperationId> {
        let Some(v) = self.values.get(value) else {
            return Vec::new();
        };
        let users: HashSet<OperationId> = v.uses.iter().map(|u| u.op).collect();
        self.order
            .iter()
            .copied()
            .filter(|op| users.contains(op))
            .collect()
    }

    /// Points operand `index` of `op` at `value`.
    pub fn set_operand(
        &mut self,
        op: OperationId,
        index: usize,
        value: ValueId,
    ) -> Result<(), InvariantError> {
        self.value(value)?;
        let operation = self.op_mut(op)?;
        let len = operation.operands.len();
        let slot = operation
            .operands
            .get_mut(index)
            .ok_or_else(|| InvariantError::OperandOutOfRange {
                op: format!("{op:?}"),
                index,
                len,
            })?;
        let old = std::mem::replace(slot, value);
        let target = Use { op, operand: index };
        if let Some(old_value) = self.values.get_mut(old) {
            old_value.uses.retain(|u| *u != target);
        }
        self.values[value].uses.push(target);
        Ok(())
    }

    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) -> Result<(), InvariantError> {
        let uses = self.value(old)?.uses.clone();
        for u in uses {
            self.set_operand(u.op, u.operand, new)?;
        }
        Ok(())
    }

    /// Like [`PirProgram::replace_all_uses_with`], restricted to uses by `users`.
    pub fn replace_uses_in(
        &mut self,
        old: ValueId,
        new: ValueId,
        users: &HashSet<OperationId>,
    ) -> Result<(), InvariantError> {
        let uses = self.value(old)?.uses.clone();
        for u in uses.into_iter().filter(|u| users.contains(&u.op)) {
            self.set_operand(u.op, u.operand, new)?;
        }
        Ok(())
    }

    /// Checks that operands are defined before use and that use lists match operands.
    pub fn verify(&self) -> Result<(), InvariantError> {
        let mut defined: HashSet<ValueId> = self.kwargs.values().copied().collect();
        let mut expected_uses = 0usize;
        for id in &self.order {
            let op = self.op(*id)?;
            for (index, operand) in op.operands.iter().enumerate() {
                if !defined.contains(operand) {
                    return Err(InvariantError::UseBeforeDef {
                        value: format!("{operand:?}"),
                        op: format!("{} ({id:?})", op.name),
                    });
                }
                let recorded = self.values[*operand].uses.iter().any(|u| {
                    *u == Use {
                        op: *id,
                        operand: index,
                    }
                });
                if !recorded {
                    return Err(InvariantError::ValueNotFound(format!(
                        "use of {operand:?} by {} ({id:?})",
                        op.name
                    )));
                }
            }
            expected_uses += op.operands.len();
            defined.extend(op.results.iter().copied());
        }
        let total_uses: usize = self.values.values().map(|v| v.uses.len()).sum();
        if total_uses != expected_uses {
            return Err(InvariantError::ValueNotFound(format!(
                "{total_uses} recorded uses for {expected_uses} operands"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PirProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        for (name, value) in &self.kwargs {
            writeln!(f, "  kwarg {name} = {value:?}")?;
        }
        for id in &self.order {
            let op = &self.ops[*id];
            writeln!(
                f,
                "  {:?} = {}({:?}) [{}]",
                op.results.as_slice(),
                op.name,
                op.operands.as_slice(),
                op.role
            )?;
        }
        write!(f, "}}")
    }
}
