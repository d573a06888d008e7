use std::collections::BTreeMap;

use crate::{current_namescope, Attribute, OpId, OpRole, OP_NAMESCOPE_KEY};

/// Attribute naming the (param, grad) pairs an op touches. Dropped when an op is replayed.
pub const OP_ROLE_VAR_KEY: &str = "op_role_var";

/// Ordered list of named argument slots, e.g. `[("X", ["a"]), ("Y", ["b"])]`.
pub type ArgumentSlots = Vec<(String, Vec<String>)>;

/// Description of a single op in an imperative block.
///
/// Var references are plain names resolved against the owning block. Renaming an argument must
/// go through [`Block`](super::Block) so its usage index stays in sync.
#[derive(Debug, Clone)]
pub struct OpDesc {
    id: OpId,
    original_id: OpId,
    op_type: String,
    inputs: ArgumentSlots,
    outputs: ArgumentSlots,
    attrs: BTreeMap<String, Attribute>,
    role: OpRole,
}

impl OpDesc {
    /// Creates an op in the current namescope.
    pub fn new(op_type: impl Into<String>) -> Self {
        let id = OpId::new();
        let mut attrs = BTreeMap::new();
        let namescope = current_namescope();
        if namescope != "/" {
            attrs.insert(OP_NAMESCOPE_KEY.to_string(), Attribute::String(namescope));
        }
        Self {
            id,
            original_id: id,
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs,
            role: OpRole::FORWARD,
        }
    }

    pub fn with_input<S: Into<String>>(
        mut self,
        slot: &str,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.inputs
            .push((slot.to_string(), names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_output<S: Into<String>>(
        mut self,
        slot: &str,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.outputs
            .push((slot.to_string(), names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Attribute>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_role(mut self, role: OpRole) -> Self {
        self.role = role;
        self
    }

    /// A structural copy with a fresh id. The copy remembers where it came from through its
    /// original id.
    pub fn structural_copy(&self) -> Self {
        Self {
            id: OpId::new(),
            ..self.clone()
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn original_id(&self) -> OpId {
        self.original_id
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn role(&self) -> OpRole {
        self.role
    }

    pub fn set_role(&mut self, role: OpRole) {
        self.role = role;
    }

    pub fn inputs(&self) -> &[(String, Vec<String>)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, Vec<String>)] {
        &self.outputs
    }

    pub fn input(&self, slot: &str) -> Option<&[String]> {
        find_slot(&self.inputs, slot)
    }

    pub fn output(&self, slot: &str) -> Option<&[String]> {
        find_slot(&self.outputs, slot)
    }

    /// All input var names in slot order. Duplicates are kept.
    pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .flat_map(|(_, names)| names.iter().map(String::as_str))
    }

    pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .flat_map(|(_, names)| names.iter().map(String::as_str))
    }

    pub fn reads(&self, name: &str) -> bool {
        self.input_arg_names().any(|n| n == name)
    }

    pub fn writes(&self, name: &str) -> bool {
        self.output_arg_names().any(|n| n == name)
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

    pub fn remove_attr(&mut self, key: &str) -> Option<Attribute> {
        self.attrs.remove(key)
    }

    pub fn namescope(&self) -> Option<&str> {
        self.attr(OP_NAMESCOPE_KEY).and_then(Attribute::as_str)
    }

    /// Returns true if any input referenced `old`.
    pub(crate) fn rename_input_arg(&mut self, old: &str, new: &str) -> bool {
        rename_in(&mut self.inputs, old, new)
    }

    /// Returns true if any output referenced `old`.
    pub(crate) fn rename_output_arg(&mut self, old: &str, new: &str) -> bool {
        rename_in(&mut self.outputs, old, new)
    }
}

fn find_slot<'a>(slots: &'a ArgumentSlots, slot: &str) -> Option<&'a [String]> {
    slots
        .iter()
        .find(|(name, _)| name == slot)
        .map(|(_, names)| names.as_slice())
}

fn rename_in(slots: &mut ArgumentSlots, old: &str, new: &str) -> bool {
    let mut found = false;
    for name in slots.iter_mut().flat_map(|(_, names)| names.iter_mut()) {
        if name == old {
            *name = new.to_string();
            found = true;
        }
    }
    found
}

impl std::fmt::Display for OpDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_slots = |slots: &ArgumentSlots| {
            slots
                .iter()
                .map(|(slot, names)| format!("{slot}={names:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{{{}}} = {}({}) [{}]",
            fmt_slots(&self.outputs),
            self.op_type,
            fmt_slots(&self.inputs),
            self.role
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NamescopeGuard;

    #[test]
    fn structural_copy_keeps_original_id() {
        let op = OpDesc::new("sgd").with_input("Grad", ["w@GRAD"]);
        let copy = op.structural_copy();
        assert_ne!(copy.id(), op.id());
        assert_eq!(copy.original_id(), op.id());
        assert_eq!(copy.structural_copy().original_id(), op.id());
    }

    #[test]
    fn ops_record_their_namescope() {
        let plain = OpDesc::new("scale");
        assert_eq!(plain.namescope(), None);
        let _guard = NamescopeGuard::new("auto_parallel/gradient_merge");
        let scoped = OpDesc::new("elementwise_add");
        assert_eq!(scoped.namescope(), Some("/auto_parallel/gradient_merge"));
    }

    #[test]
    fn rename_touches_every_occurrence() {
        let mut op = OpDesc::new("elementwise_add")
            .with_input("X", ["a"])
            .with_input("Y", ["a"])
            .with_output("Out", ["b"]);
        assert!(op.rename_input_arg("a", "c"));
        assert_eq!(op.input_arg_names().collect::<Vec<_>>(), ["c", "c"]);
        assert!(!op.rename_output_arg("a", "c"));
    }
}
