use bitflags::bitflags;

bitflags! {
    /// Compilation-stage tag of an op.
    ///
    /// Forward is the empty set; `LOSS` is combined with forward or backward for the ops that
    /// compute the loss and seed its gradient.
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct OpRole: u32 {
        const BACKWARD = 1 << 0;
        const OPTIMIZE = 1 << 1;
        const RPC      = 1 << 2;
        const DIST     = 1 << 3;
        const LR_SCHED = 1 << 4;
        const LOSS     = 1 << 8;
    }
}

impl OpRole {
    pub const FORWARD: OpRole = OpRole::empty();

    pub fn is_forward(&self) -> bool {
        *self == OpRole::FORWARD || *self == OpRole::LOSS
    }

    pub fn is_backward(&self) -> bool {
        self.contains(OpRole::BACKWARD)
    }

    pub fn is_optimize(&self) -> bool {
        self.contains(OpRole::OPTIMIZE)
    }
}

impl std::fmt::Display for OpRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_forward() {
            return f.write_str(if self.contains(OpRole::LOSS) {
                "forward|loss"
            } else {
                "forward"
            });
        }
        let mut parts = Vec::new();
        for (name, _) in self.iter_names() {
            parts.push(name.to_lowercase());
        }
        f.write_str(&parts.join("|"))
    }
}
