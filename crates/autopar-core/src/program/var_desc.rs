use crate::{DType, Shape, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VarKind {
    #[default]
    Dense,
    SelectedRows,
}

/// Structured relation of a var to another var, recorded by the pass that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarRelation {
    /// Persistent gradient accumulator of a parameter.
    AccumulatorOf { param: String },
    /// Alias introduced when a shared parameter's gradient was renamed.
    RenamedAliasOf { original: String },
}

/// Marker used in the name of renamed gradient aliases.
pub const RENAME_MARKER: &str = "@RENAME";

#[derive(Debug, Clone)]
pub struct VarDesc {
    id: VarId,
    name: String,
    shape: Shape,
    dtype: DType,
    persistable: bool,
    kind: VarKind,
    relation: Option<VarRelation>,
}

impl VarDesc {
    pub fn new(name: impl Into<String>, shape: Shape, dtype: DType) -> Self {
        Self {
            id: VarId::new(),
            name: name.into(),
            shape,
            dtype,
            persistable: false,
            kind: VarKind::Dense,
            relation: None,
        }
    }

    pub fn with_persistable(mut self, persistable: bool) -> Self {
        self.persistable = persistable;
        self
    }

    pub fn with_kind(mut self, kind: VarKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_relation(mut self, relation: VarRelation) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        self.dtype = dtype;
    }

    pub fn persistable(&self) -> bool {
        self.persistable
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }

    pub fn relation(&self) -> Option<&VarRelation> {
        self.relation.as_ref()
    }

    pub fn set_relation(&mut self, relation: Option<VarRelation>) {
        self.relation = relation;
    }

    /// Whether this var is an alias of a renamed gradient. Falls back to the naming
    /// convention for vars created without a recorded relation.
    pub fn is_renamed_alias(&self) -> bool {
        match &self.relation {
            Some(VarRelation::RenamedAliasOf { .. }) => true,
            Some(_) => false,
            None => self.name.contains(RENAME_MARKER),
        }
    }
}
