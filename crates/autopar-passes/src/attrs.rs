use std::collections::BTreeMap;

use autopar::pir::ValueId;
use derive_new::new;

use crate::PassError;

/// A parameter and its gradient. A missing gradient means the parameter is not trained.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ParamGrad<T> {
    pub param: T,
    pub grad: Option<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    /// (param, grad) pairs of an imperative program, by var name.
    ParamsGrads(Vec<ParamGrad<String>>),
    /// (param, grad) pairs of a value-graph program.
    ValueParamsGrads(Vec<ParamGrad<ValueId>>),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Bool(_) => "bool",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
            AttrValue::ParamsGrads(_) => "params_grads",
            AttrValue::ValueParamsGrads(_) => "value params_grads",
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<Vec<ParamGrad<String>>> for AttrValue {
    fn from(v: Vec<ParamGrad<String>>) -> Self {
        AttrValue::ParamsGrads(v)
    }
}

impl From<Vec<ParamGrad<ValueId>>> for AttrValue {
    fn from(v: Vec<ParamGrad<ValueId>>) -> Self {
        AttrValue::ValueParamsGrads(v)
    }
}

/// Flat key to value configuration of a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassAttrs(BTreeMap<String, AttrValue>);

impl PassAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Sets `key` only if it is not present yet.
    pub fn set_default(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    fn typed<'a, T>(
        &'a self,
        pass: &'static str,
        key: &str,
        expected: &'static str,
        extract: impl Fn(&'a AttrValue) -> Option<T>,
    ) -> Result<Option<T>, PassError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => extract(value).map(Some).ok_or_else(|| PassError::AttrType {
                pass,
                key: key.to_string(),
                expected,
                actual: value.kind(),
            }),
        }
    }

    pub fn get_int(&self, pass: &'static str, key: &str) -> Result<Option<i64>, PassError> {
        self.typed(pass, key, "int", |v| match v {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        })
    }

    pub fn get_bool(&self, pass: &'static str, key: &str) -> Result<Option<bool>, PassError> {
        self.typed(pass, key, "bool", |v| match v {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    pub fn get_params_grads(
        &self,
        pass: &'static str,
        key: &str,
    ) -> Result<&[ParamGrad<String>], PassError> {
        self.typed(pass, key, "params_grads", |v| match v {
            AttrValue::ParamsGrads(p) => Some(p.as_slice()),
            _ => None,
        })?
        .ok_or_else(|| PassError::MissingAttr {
            pass,
            key: key.to_string(),
        })
    }

    pub fn get_value_params_grads(
        &self,
        pass: &'static str,
        key: &str,
    ) -> Result<&[ParamGrad<ValueId>], PassError> {
        self.typed(pass, key, "value params_grads", |v| match v {
            AttrValue::ValueParamsGrads(p) => Some(p.as_slice()),
            _ => None,
        })?
        .ok_or_else(|| PassError::MissingAttr {
            pass,
            key: key.to_string(),
        })
    }
}
