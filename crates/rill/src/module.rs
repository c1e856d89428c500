//! Package registration, import caching and the security hook.
//!
//! Packages are registered against a dotted name as either a native
//! initializer or source text. They are initialised lazily on the first
//! import, their exported bindings cached per engine; re-imports copy
//! the cached bindings without re-running initialisation.

use ahash::AHashMap;
use std::rc::Rc;

use crate::{intern::StringId, scope::Record};

/// Consulted by the import manager before a package is resolved.
pub trait SecurityManager {
    /// Returns `false` to deny the import.
    fn check_import(&self, path: &str) -> bool;
}

/// How a registered package is initialised on first import.
pub(crate) enum PackageDef {
    /// Host-provided initializer filling a module scope.
    Native(Rc<dyn Fn(&crate::machine::Mx, crate::scope::ScopeId) -> crate::exceptions::Exec<()>>),
    /// Source text evaluated as its own module.
    Source(String),
}

impl std::fmt::Debug for PackageDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => f.write_str("PackageDef::Native"),
            Self::Source(_) => f.write_str("PackageDef::Source"),
        }
    }
}

/// Exported bindings of an initialised package.
pub(crate) type Exports = Vec<(StringId, Record)>;

#[derive(Debug, Default)]
pub(crate) struct PackageRegistry {
    defs: AHashMap<String, Rc<PackageDef>>,
    cache: AHashMap<String, Rc<Exports>>,
}

impl PackageRegistry {
    pub fn register(&mut self, path: impl Into<String>, def: PackageDef) {
        self.defs.insert(path.into(), Rc::new(def));
    }

    pub fn definition(&self, path: &str) -> Option<Rc<PackageDef>> {
        self.defs.get(path).cloned()
    }

    pub fn cached(&self, path: &str) -> Option<Rc<Exports>> {
        self.cache.get(path).cloned()
    }

    pub fn store(&mut self, path: impl Into<String>, exports: Exports) -> Rc<Exports> {
        let exports = Rc::new(exports);
        self.cache.insert(path.into(), Rc::clone(&exports));
        exports
    }
}
