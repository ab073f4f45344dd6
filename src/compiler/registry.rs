// Definition manager
//
// Named choreographies live in a process-wide registry keyed by name. The
// registry is written at definition time and read during parsing (for
// `inst`) and checking (for aux inference); it supports forward declaration
// and self/mutual recursion. A `Context` bundles the registry with the
// active configuration and the warning sink, and is the one object threaded
// through every pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::ast::role::Role;
use crate::ast::types::Type;
use crate::config::{InstrumentationError, Options};
use crate::form::Form;

/// A named, location-polymorphic choreography.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub roles: Vec<Role>,
    /// Normalized signature with a concrete aux set (declared or computed).
    pub signature: Type,
    /// One projected program per role position; `None` for a forward
    /// declaration.
    pub projections: Option<Vec<Form>>,
}

impl Definition {
    pub fn is_forward(&self) -> bool {
        self.projections.is_none()
    }

    pub fn role_index(&self, role: &Role) -> Option<usize> {
        self.roles.iter().position(|r| r == role)
    }

    /// Signature with role parameters replaced by their position index, the
    /// form under which signatures are compared (alpha-equivalence).
    pub fn positional_signature(&self) -> Type {
        let subst: HashMap<Role, Role> = self
            .roles
            .iter()
            .enumerate()
            .map(|(i, r)| (r.clone(), Role::new(format!("%{i}"))))
            .collect();
        self.signature.clone().substitute(&subst).normalize()
    }
}

/// True when the two definitions have the same arity and structurally equal
/// signatures up to renaming of role parameters by position.
pub fn alpha_equivalent(a: &Definition, b: &Definition) -> bool {
    a.roles.len() == b.roles.len() && a.positional_signature() == b.positional_signature()
}

/// Aux-specification and registry failures.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("choreography {name} must declare its auxiliary set explicitly when self-referencing")]
    MissingAux { name: String },

    #[error("unknown choreography {0}")]
    Unknown(String),

    #[error("definition registry is frozen during projection")]
    Frozen,
}

/// A compile-time warning. Warnings are reported through `tracing` and
/// recorded on the context so callers can inspect them.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    SignatureChanged { name: String, old: String, new: String },
    UnusedRoleParam { name: String, role: Role },
    UnorderedCommunication { form: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::SignatureChanged { name, old, new } => write!(
                f,
                "signature of {name} changed from {old} to {new}; recompile dependent choreographies"
            ),
            Warning::UnusedRoleParam { name, role } => {
                write!(f, "role parameter {role} of {name} is never used in the body")
            }
            Warning::UnorderedCommunication { form } => write!(
                f,
                "unordered collection {form} communicates in more than one element; element order, and so communication order, is non-deterministic"
            ),
        }
    }
}

#[derive(Default)]
struct Registry {
    defs: HashMap<String, Arc<Definition>>,
}

/// Shared compilation context.
#[derive(Clone, Default)]
pub struct Context {
    registry: Arc<RwLock<Registry>>,
    opts: Arc<RwLock<Options>>,
    warnings: Arc<Mutex<Vec<Warning>>>,
    frozen: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Definition>> {
        self.registry.read().expect("registry lock poisoned").defs.get(name).cloned()
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn opts(&self) -> Options {
        self.opts.read().expect("options lock poisoned").clone()
    }

    /// Change the process-wide default configuration.
    pub fn alter_opts(&self, form: &Form) -> Result<(), InstrumentationError> {
        let updated = self.opts().updated(form)?;
        *self.opts.write().expect("options lock poisoned") = updated;
        Ok(())
    }

    /// Scope a configuration override around `body`.
    pub fn with_opts<T>(
        &self,
        form: &Form,
        body: impl FnOnce(&Context) -> T,
    ) -> Result<T, InstrumentationError> {
        let saved = self.opts();
        let updated = saved.updated(form)?;
        *self.opts.write().expect("options lock poisoned") = updated;
        let out = body(self);
        *self.opts.write().expect("options lock poisoned") = saved;
        Ok(out)
    }

    pub fn warn(&self, warning: Warning) {
        tracing::warn!("{warning}");
        self.warnings.lock().expect("warning sink poisoned").push(warning);
    }

    /// Drain the recorded warnings.
    pub fn take_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.warnings.lock().expect("warning sink poisoned"))
    }

    /// Prevent registry mutation while projection reads it.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    /// Install a definition under its declared signature before its body is
    /// analyzed, so self and mutual references resolve. The returned guard
    /// rolls the entry back unless `commit` is called.
    pub fn install(&self, def: Definition) -> Result<InstallGuard<'_>, DefinitionError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(DefinitionError::Frozen);
        }
        let name = def.name.clone();
        let mut registry = self.registry.write().expect("registry lock poisoned");
        let prev = registry.defs.get(&name).cloned();
        if let Some(old) = &prev {
            if !alpha_equivalent(old, &def) {
                drop(registry);
                self.warn(Warning::SignatureChanged {
                    name: name.clone(),
                    old: old.signature.rendered(),
                    new: def.signature.rendered(),
                });
                registry = self.registry.write().expect("registry lock poisoned");
            }
        }
        registry.defs.insert(name.clone(), Arc::new(def));
        drop(registry);
        Ok(InstallGuard { ctx: self, name, prev, committed: false })
    }
}

/// Rollback guard for a registry installation.
pub struct InstallGuard<'a> {
    ctx: &'a Context,
    name: String,
    prev: Option<Arc<Definition>>,
    committed: bool,
}

impl InstallGuard<'_> {
    /// Replace the declared entry with the fully compiled definition.
    pub fn commit(mut self, def: Definition) {
        let mut registry = self.ctx.registry.write().expect("registry lock poisoned");
        registry.defs.insert(self.name.clone(), Arc::new(def));
        self.committed = true;
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut registry = self.ctx.registry.write().expect("registry lock poisoned");
        match self.prev.take() {
            Some(prev) => registry.defs.insert(self.name.clone(), prev),
            None => registry.defs.remove(&self.name),
        };
    }
}
