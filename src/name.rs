//! Stable module identifiers.
//!
//! Slots reference modules by name rather than by owning pointer so that
//! the module graph never needs cyclic `Rc`/`Arc` references between
//! producer and consumer (`spec.md` §9, "Cyclic references").

use std::fmt;
use std::sync::Arc;

/// A process-unique identifier for a module: either scheduler-generated
/// (`<type>_<n>`, falling back to a UUID suffix under congestion) or
/// supplied by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleName(Arc<str>);

impl ModuleName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ModuleName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleName {
    fn from(s: &str) -> Self {
        ModuleName::new(s)
    }
}

impl From<String> for ModuleName {
    fn from(s: String) -> Self {
        ModuleName::new(s)
    }
}

impl std::borrow::Borrow<str> for ModuleName {
    fn borrow(&self) -> &str {
        &self.0
    }
}
