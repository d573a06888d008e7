use std::collections::BTreeMap;
use std::fmt::Write;

use autopar::{DType, Shape};
use derive_new::new;
use serde::{Deserialize, Serialize};

/// A traced value, named `var_<n>` by the trace context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    /// A call of a traced function.
    Call,
    /// A framework API such as `paddle.add`.
    Api,
    /// A tensor method such as `__add__`.
    Method,
    /// A layer's forward.
    Layer,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Call => "call",
            StatementKind::Api => "api",
            StatementKind::Method => "method",
            StatementKind::Layer => "layer",
        }
    }
}

#[derive(new, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub name: String,
    pub inputs: Vec<Symbol>,
    pub outputs: Vec<Symbol>,
}

/// Shape and dtype of a symbol. Dynamic dimensions are `-1`.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaInfo {
    pub shape: Shape,
    pub dtype: DType,
}

/// Statement IR: the straight-line program recorded while tracing one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementIr {
    pub name: String,
    pub inputs: Vec<Symbol>,
    pub outputs: Vec<Symbol>,
    pub statements: Vec<Statement>,
    pub symbol_meta_map: BTreeMap<Symbol, MetaInfo>,
}

impl StatementIr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            statements: Vec::new(),
            symbol_meta_map: BTreeMap::new(),
        }
    }

    pub fn add_input(&mut self, symbol: Symbol, meta: MetaInfo) {
        self.symbol_meta_map.insert(symbol.clone(), meta);
        self.inputs.push(symbol);
    }

    pub fn add_statement(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn set_symbol_meta(&mut self, symbol: Symbol, meta: MetaInfo) {
        self.symbol_meta_map.insert(symbol, meta);
    }

    pub fn meta(&self, symbol: &Symbol) -> Option<&MetaInfo> {
        self.symbol_meta_map.get(symbol)
    }

    pub fn set_outputs(&mut self, outputs: Vec<Symbol>) {
        self.outputs = outputs;
    }

    /// Symbols in order of first appearance: inputs, then statement operands, then outputs.
    fn symbols_in_order(&self) -> impl Iterator<Item = &Symbol> {
        self.inputs
            .iter()
            .chain(
                self.statements
                    .iter()
                    .flat_map(|s| s.inputs.iter().chain(s.outputs.iter())),
            )
            .chain(self.outputs.iter())
    }

    /// Structural form of the program. Two traces that differ only in their own name and in the
    /// naming of their symbols have the same canonical form.
    pub fn canonical(&self) -> String {
        let mut renames: BTreeMap<&Symbol, usize> = BTreeMap::new();
        for symbol in self.symbols_in_order() {
            let next = renames.len();
            renames.entry(symbol).or_insert(next);
        }
        let sym = |s: &Symbol| format!("%{}", renames[s]);
        let list = |symbols: &[Symbol]| symbols.iter().map(sym).collect::<Vec<_>>().join(", ");

        let mut out = String::new();
        let _ = writeln!(out, "({})", list(&self.inputs));
        for s in &self.statements {
            let _ = writeln!(
                out,
                "  {} = {}:{}({})",
                list(&s.outputs),
                s.kind.as_str(),
                s.name,
                list(&s.inputs)
            );
        }
        for symbol in self.symbols_in_order() {
            let id = renames[symbol];
            if let Some(meta) = self.symbol_meta_map.get(symbol) {
                let _ = writeln!(out, "  %{id}: {}{:?}", meta.dtype, meta.shape);
            }
        }
        let _ = write!(out, "  -> ({})", list(&self.outputs));
        out
    }
}

impl std::fmt::Display for StatementIr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |symbols: &[Symbol]| {
            symbols
                .iter()
                .map(Symbol::name)
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(f, "StatementIR: {}", self.name)?;
        writeln!(f, "  inputs: [{}]", join(&self.inputs))?;
        writeln!(f, "  outputs: [{}]", join(&self.outputs))?;
        writeln!(f, "  statements:")?;
        for s in &self.statements {
            writeln!(
                f,
                "    {}: ({}) <- {}({})",
                s.kind.as_str(),
                join(&s.outputs),
                s.name,
                join(&s.inputs)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopar::shape;

    fn meta() -> MetaInfo {
        MetaInfo::new(shape![-1, 4], DType::F32)
    }

    fn add_sir(name: &str, prefix: &str) -> StatementIr {
        let s = |i: usize| Symbol::new(format!("{prefix}{i}"));
        let mut sir = StatementIr::new(name);
        sir.add_input(s(0), meta());
        sir.add_input(s(1), meta());
        sir.add_statement(Statement::new(
            StatementKind::Api,
            "paddle.add".into(),
            vec![s(0), s(1)],
            vec![s(2)],
        ));
        sir.set_symbol_meta(s(2), meta());
        sir.set_outputs(vec![s(2)]);
        sir
    }

    #[test]
    fn canonical_form_ignores_names() {
        let a = add_sir("SIR_0", "var_");
        let b = add_sir("SIR_7", "t");
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.canonical(), b.canonical());
        assert!(!a.canonical().contains("SIR_0"));
    }

    #[test]
    fn canonical_form_sees_structure() {
        let a = add_sir("SIR_0", "var_");
        let mut b = a.clone();
        b.statements[0].name = "paddle.subtract".into();
        assert_ne!(a.canonical(), b.canonical());

        let mut c = a.clone();
        c.set_symbol_meta(Symbol::new("var_2"), MetaInfo::new(shape![2, 4], DType::F32));
        assert_ne!(a.canonical(), c.canonical());
    }
}
