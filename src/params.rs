//! The per-module parameter row.
//!
//! `spec.md` §3 declares `params` a "single-row record of declared
//! parameters (name, type, default)" with two parameters always present:
//! `quantum` (float seconds, default 0.5) and `debug` (bool). §9 flags the
//! Python metaclass-based parameter inheritance (`all_parameters`) as
//! REDESIGN material and asks for "an explicit `declare_parameters`
//! collected at module registration time into a merged descriptor list
//! per kind" plus a versioned immutable snapshot read at step
//! boundaries. Both are implemented here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

/// A scalar parameter value. Modules declare defaults of one of these
/// variants; `set`/`get` type-check against the declared variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ParamValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ParamValue::Float(v) => serde_json::json!(v),
            ParamValue::Bool(v) => serde_json::json!(v),
            ParamValue::Int(v) => serde_json::json!(v),
            ParamValue::Str(v) => serde_json::json!(v),
        }
    }

    fn same_kind(&self, other: &ParamValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// One declared parameter: name, default value (its variant doubles as
/// the declared type, there being no separate type tag needed in Rust).
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: ParamValue,
}

impl ParamSpec {
    pub const fn new(name: &'static str, default: ParamValue) -> Self {
        ParamSpec { name, default }
    }
}

/// The two parameters every module carries implicitly (`spec.md` §3).
pub fn base_parameters() -> &'static [ParamSpec] {
    const BASE: &[ParamSpec] = &[
        ParamSpec::new("quantum", ParamValue::Float(0.5)),
        ParamSpec::new("debug", ParamValue::Bool(false)),
    ];
    BASE
}

/// An immutable snapshot of a module's current parameter values, the
/// Rust rendition of "a versioned immutable snapshot updated at step
/// boundaries; readers inside `run_step` observe a consistent copy"
/// (`spec.md` §9).
#[derive(Debug, Clone, Serialize)]
pub struct ParamsRow(HashMap<String, ParamValue>);

impl ParamsRow {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn quantum(&self) -> f64 {
        match self.0.get("quantum") {
            Some(ParamValue::Float(v)) => *v,
            _ => 0.5,
        }
    }

    pub fn debug(&self) -> bool {
        matches!(self.0.get("debug"), Some(ParamValue::Bool(true)))
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.0 {
            map.insert(k.clone(), v.to_json());
        }
        JsonValue::Object(map)
    }
}

/// The mutable parameter table owned by a module. `current()` hands out
/// a cheap clone of the latest snapshot; `set` validates the new value's
/// variant matches the declared spec before publishing a new snapshot.
#[derive(Debug, Clone)]
pub struct Params {
    specs: Vec<ParamSpec>,
    current: Arc<ParamsRow>,
}

impl Params {
    /// Build a params table from a merged, base-first list of declared
    /// specs (duplicates by name are resolved last-wins, matching the
    /// Python metaclass's `all_props = list(cls.parameters) + bases...`
    /// ordering where the most-derived class's declarations come last
    /// and are looked up by the consumer first).
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        let mut row = HashMap::new();
        for spec in &specs {
            row.insert(spec.name.to_string(), spec.default.clone());
        }
        Params {
            specs,
            current: Arc::new(ParamsRow(row)),
        }
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn current(&self) -> Arc<ParamsRow> {
        Arc::clone(&self.current)
    }

    pub fn quantum(&self) -> f64 {
        self.current.quantum()
    }

    pub fn debug(&self) -> bool {
        self.current.debug()
    }

    /// Set a parameter's value, type-checked against its declared
    /// default. Publishes a new snapshot so that readers holding an
    /// older `Arc<ParamsRow>` keep observing a consistent copy.
    pub fn set(&mut self, name: &str, value: ParamValue) -> Result<(), String> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| format!("unknown parameter '{name}'"))?;
        if !spec.default.same_kind(&value) {
            return Err(format!(
                "parameter '{name}' expects a {:?}-shaped value",
                spec.default
            ));
        }
        let mut row = (*self.current).clone();
        row.0.insert(name.to_string(), value);
        self.current = Arc::new(row);
        Ok(())
    }
}

/// Merge a module kind's own declared parameters with those inherited
/// from its base chain, base-first, mirroring `ModuleMeta.__init__`:
/// `all_props = list(cls.parameters); for base in bases: all_props +=
/// base.all_parameters`. The implicit `quantum`/`debug` base is always
/// included first.
pub fn merge_parameters(
    base_chain: &[fn() -> &'static [ParamSpec]],
    own: &'static [ParamSpec],
) -> Vec<ParamSpec> {
    let mut merged: Vec<ParamSpec> = base_parameters().to_vec();
    for base in base_chain {
        merged.extend(base().iter().cloned());
    }
    merged.extend(own.iter().cloned());
    merged
}
