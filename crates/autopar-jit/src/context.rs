use std::collections::BTreeMap;

use crate::{MetaInfo, Statement, StatementIr, StatementKind, Symbol};

/// Records statements while a function is traced. Each traced function gets its own
/// [`StatementIr`], named `SIR_<n>`.
#[derive(Debug, Default)]
pub struct SymbolicTraceContext {
    sirs: BTreeMap<String, StatementIr>,
    current: Option<String>,
    num_symbols: usize,
}

impl SymbolicTraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording into a fresh statement IR and returns its name.
    pub fn start_sir(&mut self) -> String {
        let name = format!("SIR_{}", self.sirs.len());
        self.sirs.insert(name.clone(), StatementIr::new(name.clone()));
        self.current = Some(name.clone());
        name
    }

    pub fn new_symbol(&mut self) -> Symbol {
        let symbol = Symbol::new(format!("var_{}", self.num_symbols));
        self.num_symbols += 1;
        symbol
    }

    fn current_mut(&mut self) -> &mut StatementIr {
        if self.current.is_none() {
            self.start_sir();
        }
        let name = self.current.clone().unwrap_or_default();
        self.sirs
            .entry(name.clone())
            .or_insert_with(|| StatementIr::new(name))
    }

    /// Declares an input of the current trace.
    pub fn input(&mut self, meta: MetaInfo) -> Symbol {
        let symbol = self.new_symbol();
        self.current_mut().add_input(symbol.clone(), meta);
        symbol
    }

    /// Records `outputs = name(inputs)` with one output per entry of `output_metas`.
    pub fn record(
        &mut self,
        kind: StatementKind,
        name: &str,
        inputs: &[Symbol],
        output_metas: Vec<MetaInfo>,
    ) -> Vec<Symbol> {
        let outputs: Vec<Symbol> = output_metas.iter().map(|_| self.new_symbol()).collect();
        let sir = self.current_mut();
        for (symbol, meta) in outputs.iter().zip(output_metas) {
            sir.set_symbol_meta(symbol.clone(), meta);
        }
        sir.add_statement(Statement::new(
            kind,
            name.to_string(),
            inputs.to_vec(),
            outputs.clone(),
        ));
        outputs
    }

    pub fn call_api(&mut self, name: &str, inputs: &[Symbol], output_meta: MetaInfo) -> Symbol {
        self.record(StatementKind::Api, name, inputs, vec![output_meta])
            .remove(0)
    }

    pub fn call_method(&mut self, name: &str, inputs: &[Symbol], output_meta: MetaInfo) -> Symbol {
        self.record(StatementKind::Method, name, inputs, vec![output_meta])
            .remove(0)
    }

    /// Finishes the current trace with `outputs` and returns its name.
    pub fn finish(&mut self, outputs: Vec<Symbol>) -> Option<String> {
        let name = self.current.take()?;
        if let Some(sir) = self.sirs.get_mut(&name) {
            sir.set_outputs(outputs);
        }
        Some(name)
    }

    pub fn get_sir(&self, name: &str) -> Option<&StatementIr> {
        self.sirs.get(name)
    }

    pub fn sir_names(&self) -> impl Iterator<Item = &str> {
        self.sirs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopar::{shape, DType};

    #[test]
    fn traces_are_recorded_separately() {
        let mut ctx = SymbolicTraceContext::new();
        let first = ctx.start_sir();
        let x = ctx.input(MetaInfo::new(shape![2], DType::F32));
        let y = ctx.call_api("paddle.assign", &[x.clone()], MetaInfo::new(shape![2], DType::F32));
        assert_eq!(ctx.finish(vec![y.clone()]), Some(first.clone()));

        let second = ctx.start_sir();
        assert_ne!(first, second);
        let sir = ctx.get_sir(&first).unwrap();
        assert_eq!(sir.inputs, vec![x]);
        assert_eq!(sir.outputs, vec![y.clone()]);
        assert_eq!(sir.statements.len(), 1);
        assert!(sir.meta(&y).is_some());
        assert!(ctx.get_sir(&second).unwrap().statements.is_empty());
        assert_eq!(ctx.sir_names().count(), 2);
    }
}
