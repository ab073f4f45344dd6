// Binding environment carried by every AST node

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ast::role::{Role, RoleSet};
use crate::ast::types::Type;

static NEXT_UID: AtomicU64 = AtomicU64::new(0);
static NEXT_LOOP: AtomicU64 = AtomicU64::new(0);

/// A stable process-unique name for a binding, derived from its source form.
pub fn fresh_uid(stem: &str) -> String {
    format!("{stem}__{}", NEXT_UID.fetch_add(1, Ordering::Relaxed))
}

/// A fresh recur point identifier, installed at each `chor`.
pub fn fresh_loop_id() -> u64 {
    NEXT_LOOP.fetch_add(1, Ordering::Relaxed)
}

/// A local binding. `path` is the position path within the enclosing
/// `unpack`/parameter binder; empty means the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub sym: String,
    pub uid: String,
    pub path: Vec<usize>,
    pub rtype: Option<Type>,
}

impl Binding {
    pub fn new(sym: impl Into<String>) -> Self {
        let sym = sym.into();
        let uid = fresh_uid(&sym);
        Binding { sym, uid, path: Vec::new(), rtype: None }
    }

    pub fn at_path(mut self, path: Vec<usize>) -> Self {
        self.path = path;
        self
    }
}

/// A possibly nested binder: a symbol, or a vector of binders.
#[derive(Debug, Clone, PartialEq)]
pub enum Binder {
    Sym { sym: String, uid: String },
    Vec(Vec<Binder>),
}

impl Binder {
    pub fn sym(name: impl Into<String>) -> Self {
        let sym = name.into();
        let uid = fresh_uid(&sym);
        Binder::Sym { sym, uid }
    }

    /// Leaf bindings together with their position paths, left to right.
    pub fn leaves(&self) -> Vec<(String, String, Vec<usize>)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut out);
        out
    }

    fn collect_leaves(&self, path: &mut Vec<usize>, out: &mut Vec<(String, String, Vec<usize>)>) {
        match self {
            Binder::Sym { sym, uid } => out.push((sym.clone(), uid.clone(), path.clone())),
            Binder::Vec(items) => {
                for (i, item) in items.iter().enumerate() {
                    path.push(i);
                    item.collect_leaves(path, out);
                    path.pop();
                }
            }
        }
    }
}

/// The environment of a node: role scope, locals, lifting mask and the
/// parse context flags threaded by the parser.
#[derive(Debug, Clone)]
pub struct Env {
    pub roles: Vec<Role>,
    pub locals: HashMap<String, Binding>,
    pub mask: RoleSet,
    pub tail: bool,
    pub loop_id: Option<u64>,
}

impl Env {
    /// The environment at the top of a definition: the mask equals the full
    /// role vector.
    pub fn top(roles: Vec<Role>) -> Self {
        let mask = roles.iter().cloned().collect();
        Env { roles, locals: HashMap::new(), mask, tail: true, loop_id: None }
    }

    pub fn is_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r.name() == name)
    }

    pub fn role_index(&self, role: &Role) -> Option<usize> {
        self.roles.iter().position(|r| r == role)
    }

    pub fn lookup(&self, sym: &str) -> Option<&Binding> {
        self.locals.get(sym)
    }

    pub fn bind(&mut self, binding: Binding) {
        self.locals.insert(binding.sym.clone(), binding);
    }

    /// Child environment in non-tail position.
    pub fn non_tail(&self) -> Self {
        let mut env = self.clone();
        env.tail = false;
        env
    }

    /// Child environment inheriting tail context.
    pub fn in_tail(&self) -> Self {
        self.clone()
    }

    pub fn with_mask(&self, mask: RoleSet) -> Self {
        let mut env = self.clone();
        env.mask = mask;
        env
    }

    /// Record checked binding types; used by the checker so that every
    /// environment in the final tree carries type information.
    pub fn annotate_locals(&mut self, types: &HashMap<String, Type>) {
        for binding in self.locals.values_mut() {
            if binding.rtype.is_none() {
                if let Some(t) = types.get(&binding.uid) {
                    binding.rtype = Some(t.clone());
                }
            }
        }
    }
}
