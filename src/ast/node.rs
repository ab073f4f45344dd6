// AST node variants for the choreographic surface language
//
// Nodes carry their environment, the original surface form (with its span),
// and, after checking, a choreographic type plus the set of roles that
// participate in their evaluation.

use crate::ast::env::{Binder, Binding, Env};
use crate::ast::role::{Role, RoleSet};
use crate::ast::types::Type;
use crate::form::{Form, Span};

/// A checked or unchecked AST node.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub env: Env,
    pub form: Form,
    pub rtype: Option<Type>,
    pub rmentions: RoleSet,
}

/// One `catch` clause of a `try`.
#[derive(Debug, Clone)]
pub struct CatchClause {
    pub sym: String,
    pub uid: String,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    // Choreographic operators
    /// Restrict an agreement to a subset of its roles.
    Narrow { roles: Vec<Role>, expr: Box<Node> },
    /// Set the mask used when lifting literals and host values.
    Lifting { roles: Vec<Role>, body: Vec<Node> },
    /// Communication: extend an agreement by one role.
    Copy { src: Role, dst: Role, expr: Box<Node> },
    /// Tuple constructor.
    Pack { exprs: Vec<Node> },
    /// Tuple destructor with a positional binder.
    Unpack { binder: Binder, init: Box<Node>, body: Vec<Node> },
    /// Anonymous (or named, for self reference) choreography.
    Chor {
        name: Option<String>,
        sig: Type,
        params: Vec<Binder>,
        body: Vec<Node>,
        loop_id: u64,
        /// True only for the body chor of a definition; its aux may be
        /// left unspecified and is then computed by the checker.
        top_level: bool,
    },
    /// Instantiate a named choreography with concrete roles.
    Inst { name: String, roles: Vec<Role>, check_sig: bool },
    /// Assert agreement between disjoint agreements without communicating.
    Agree { exprs: Vec<Node> },

    // Host forms, reused uninterpreted
    Let { bindings: Vec<(Binding, Node)>, body: Vec<Node> },
    Do { body: Vec<Node> },
    If { test: Box<Node>, then: Box<Node>, els: Box<Node> },
    Case { expr: Box<Node>, clauses: Vec<(Form, Node)>, default: Option<Box<Node>> },
    Fn { name: Option<String>, params: Vec<Binding>, body: Vec<Node> },
    Invoke { op: Box<Node>, args: Vec<Node> },
    Recur { args: Vec<Node>, loop_id: u64 },
    Local { sym: String, uid: String },
    VarRef { sym: String },
    Quote { form: Form },
    Const { form: Form },
    VectorLit { items: Vec<Node> },
    MapLit { pairs: Vec<(Node, Node)> },
    SetLit { items: Vec<Node> },
    Throw { expr: Box<Node> },
    Try { body: Vec<Node>, catches: Vec<CatchClause>, finally: Option<Vec<Node>> },
}

impl Node {
    pub fn new(kind: NodeKind, env: Env, form: Form) -> Self {
        Node { kind, env, form, rtype: None, rmentions: RoleSet::new() }
    }

    pub fn span(&self) -> Option<Span> {
        self.form.span
    }

    /// Short operator name, used in diagnostics.
    pub fn op_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Narrow { .. } => "narrow",
            NodeKind::Lifting { .. } => "lifting",
            NodeKind::Copy { .. } => "copy",
            NodeKind::Pack { .. } => "pack",
            NodeKind::Unpack { .. } => "unpack",
            NodeKind::Chor { .. } => "chor",
            NodeKind::Inst { .. } => "inst",
            NodeKind::Agree { .. } => "agree!",
            NodeKind::Let { .. } => "let",
            NodeKind::Do { .. } => "do",
            NodeKind::If { .. } => "if",
            NodeKind::Case { .. } => "case",
            NodeKind::Fn { .. } => "fn",
            NodeKind::Invoke { .. } => "invoke",
            NodeKind::Recur { .. } => "recur",
            NodeKind::Local { .. } => "local",
            NodeKind::VarRef { .. } => "var",
            NodeKind::Quote { .. } => "quote",
            NodeKind::Const { .. } => "const",
            NodeKind::VectorLit { .. } => "vector",
            NodeKind::MapLit { .. } => "map",
            NodeKind::SetLit { .. } => "set",
            NodeKind::Throw { .. } => "throw",
            NodeKind::Try { .. } => "try",
        }
    }

    /// True when `role` participates in evaluating this node. Only
    /// meaningful after checking.
    pub fn mentions(&self, role: &Role) -> bool {
        self.rmentions.contains(role)
    }

    /// True when this node's value is present at `role`.
    pub fn has_result(&self, role: &Role) -> bool {
        self.rtype.as_ref().is_some_and(|t| t.roles_of().contains(role))
    }

    /// Child nodes in evaluation order.
    pub fn children(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        match &self.kind {
            NodeKind::Narrow { expr, .. } | NodeKind::Copy { expr, .. } | NodeKind::Throw { expr } => {
                out.push(expr.as_ref());
            }
            NodeKind::Lifting { body, .. } | NodeKind::Do { body } => out.extend(body.iter()),
            NodeKind::Pack { exprs } | NodeKind::Agree { exprs } => out.extend(exprs.iter()),
            NodeKind::Unpack { init, body, .. } => {
                out.push(init.as_ref());
                out.extend(body.iter());
            }
            NodeKind::Chor { body, .. } | NodeKind::Fn { body, .. } => out.extend(body.iter()),
            NodeKind::Inst { .. }
            | NodeKind::Local { .. }
            | NodeKind::VarRef { .. }
            | NodeKind::Quote { .. }
            | NodeKind::Const { .. } => {}
            NodeKind::Let { bindings, body } => {
                out.extend(bindings.iter().map(|(_, init)| init));
                out.extend(body.iter());
            }
            NodeKind::If { test, then, els } => {
                out.push(test.as_ref());
                out.push(then.as_ref());
                out.push(els.as_ref());
            }
            NodeKind::Case { expr, clauses, default } => {
                out.push(expr.as_ref());
                out.extend(clauses.iter().map(|(_, n)| n));
                if let Some(d) = default {
                    out.push(d.as_ref());
                }
            }
            NodeKind::Invoke { op, args } => {
                out.push(op.as_ref());
                out.extend(args.iter());
            }
            NodeKind::Recur { args, .. } => out.extend(args.iter()),
            NodeKind::VectorLit { items } | NodeKind::SetLit { items } => out.extend(items.iter()),
            NodeKind::MapLit { pairs } => {
                for (k, v) in pairs {
                    out.push(k);
                    out.push(v);
                }
            }
            NodeKind::Try { body, catches, finally } => {
                out.extend(body.iter());
                for catch in catches {
                    out.extend(catch.body.iter());
                }
                if let Some(fin) = finally {
                    out.extend(fin.iter());
                }
            }
        }
        out
    }

    /// Child nodes in evaluation order, mutably. Mirrors [`Node::children`].
    pub fn children_mut(&mut self) -> Vec<&mut Node> {
        let mut out: Vec<&mut Node> = Vec::new();
        match &mut self.kind {
            NodeKind::Narrow { expr, .. } | NodeKind::Copy { expr, .. } | NodeKind::Throw { expr } => {
                out.push(expr.as_mut());
            }
            NodeKind::Lifting { body, .. } | NodeKind::Do { body } => out.extend(body.iter_mut()),
            NodeKind::Pack { exprs } | NodeKind::Agree { exprs } => out.extend(exprs.iter_mut()),
            NodeKind::Unpack { init, body, .. } => {
                out.push(init.as_mut());
                out.extend(body.iter_mut());
            }
            NodeKind::Chor { body, .. } | NodeKind::Fn { body, .. } => out.extend(body.iter_mut()),
            NodeKind::Inst { .. }
            | NodeKind::Local { .. }
            | NodeKind::VarRef { .. }
            | NodeKind::Quote { .. }
            | NodeKind::Const { .. } => {}
            NodeKind::Let { bindings, body } => {
                out.extend(bindings.iter_mut().map(|(_, init)| init));
                out.extend(body.iter_mut());
            }
            NodeKind::If { test, then, els } => {
                out.push(test.as_mut());
                out.push(then.as_mut());
                out.push(els.as_mut());
            }
            NodeKind::Case { expr, clauses, default } => {
                out.push(expr.as_mut());
                out.extend(clauses.iter_mut().map(|(_, n)| n));
                if let Some(d) = default {
                    out.push(d.as_mut());
                }
            }
            NodeKind::Invoke { op, args } => {
                out.push(op.as_mut());
                out.extend(args.iter_mut());
            }
            NodeKind::Recur { args, .. } => out.extend(args.iter_mut()),
            NodeKind::VectorLit { items } | NodeKind::SetLit { items } => out.extend(items.iter_mut()),
            NodeKind::MapLit { pairs } => {
                for (k, v) in pairs {
                    out.push(k);
                    out.push(v);
                }
            }
            NodeKind::Try { body, catches, finally } => {
                out.extend(body.iter_mut());
                for catch in catches {
                    out.extend(catch.body.iter_mut());
                }
                if let Some(fin) = finally {
                    out.extend(fin.iter_mut());
                }
            }
        }
        out
    }

    /// Walk the tree post-order, children first.
    pub fn postorder<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        for child in self.children() {
            child.postorder(visit);
        }
        visit(self);
    }
}
