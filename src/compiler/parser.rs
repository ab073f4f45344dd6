// Parser for the choreographic surface syntax
//
// Input is a surface form plus the current environment; output is an AST
// node or a precise `ParseError`. The parser never guesses: every rejection
// names the offending form and its source location.

use thiserror::Error;

use crate::ast::env::{Binder, Binding, Env};
use crate::ast::node::{CatchClause, Node, NodeKind};
use crate::ast::role::Role;
use crate::ast::types::{parse_type, Aux, Type};
use crate::compiler::registry::Context;
use crate::form::{Form, FormKind, Span};

/// Syntactic rejection in the parser.
#[derive(Debug, Error)]
#[error("parse error in {form}: {reason}")]
pub struct ParseError {
    pub reason: String,
    pub form: Form,
    pub span: Option<Span>,
}

fn err(form: &Form, reason: impl Into<String>) -> ParseError {
    ParseError { reason: reason.into(), form: form.clone(), span: form.span }
}

/// The reserved operator names of the surface language.
pub const SPECIAL_OPS: &[&str] = &[
    "narrow", "lifting", "copy", "pack", "unpack", "chor", "inst", "agree!",
];

pub struct Parser<'a> {
    ctx: &'a Context,
}

impl<'a> Parser<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Parser { ctx }
    }

    /// Parse one expression under `env`.
    pub fn parse(&self, form: &Form, env: &Env) -> Result<Node, ParseError> {
        match &form.kind {
            FormKind::Nil | FormKind::Bool(_) | FormKind::Int(_) | FormKind::Str(_) | FormKind::Keyword(_) => {
                Ok(Node::new(NodeKind::Const { form: form.clone() }, env.clone(), form.clone()))
            }
            FormKind::Sym(name) => self.parse_symbol(form, name, env),
            FormKind::Vector(items) => {
                let parsed = self.parse_all(items, env)?;
                Ok(Node::new(NodeKind::VectorLit { items: parsed }, env.clone(), form.clone()))
            }
            FormKind::Set(items) => {
                let parsed = self.parse_all(items, env)?;
                Ok(Node::new(NodeKind::SetLit { items: parsed }, env.clone(), form.clone()))
            }
            FormKind::Map(pairs) => {
                let mut parsed = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    parsed.push((self.parse(k, &env.non_tail())?, self.parse(v, &env.non_tail())?));
                }
                Ok(Node::new(NodeKind::MapLit { pairs: parsed }, env.clone(), form.clone()))
            }
            FormKind::List(items) => self.parse_list(form, items, env),
        }
    }

    fn parse_all(&self, forms: &[Form], env: &Env) -> Result<Vec<Node>, ParseError> {
        forms.iter().map(|f| self.parse(f, &env.non_tail())).collect()
    }

    /// Parse a body: every expression but the last is non-tail; the last
    /// inherits the surrounding tail context. An empty body is `nil`.
    fn parse_body(&self, forms: &[Form], env: &Env, parent: &Form) -> Result<Vec<Node>, ParseError> {
        if forms.is_empty() {
            return Ok(vec![Node::new(
                NodeKind::Const { form: Form::nil() },
                env.non_tail(),
                parent.clone(),
            )]);
        }
        let mut out = Vec::with_capacity(forms.len());
        for (i, f) in forms.iter().enumerate() {
            let child_env = if i + 1 == forms.len() { env.in_tail() } else { env.non_tail() };
            out.push(self.parse(f, &child_env)?);
        }
        Ok(out)
    }

    fn parse_symbol(&self, form: &Form, name: &str, env: &Env) -> Result<Node, ParseError> {
        if let Some(binding) = env.lookup(name) {
            let kind = NodeKind::Local { sym: binding.sym.clone(), uid: binding.uid.clone() };
            return Ok(Node::new(kind, env.clone(), form.clone()));
        }
        if env.is_role(name) {
            return Err(err(form, format!("role {name} cannot be used as an expression")));
        }
        // Role/name sugar: A/x is (lifting [A] x).
        if let Some((left, right)) = name.split_once('/') {
            if env.is_role(left) && !right.is_empty() {
                let role = Role::new(left);
                let mask_env = env.with_mask([role.clone()].into_iter().collect());
                let inner = self.parse_symbol(form, right, &mask_env)?;
                let kind = NodeKind::Lifting { roles: vec![role], body: vec![inner] };
                return Ok(Node::new(kind, env.clone(), form.clone()));
            }
        }
        if self.ctx.is_defined(name) && !crate::runtime::interp::is_builtin(name) {
            return Err(err(
                form,
                format!("choreography {name} must be instantiated with inst before use"),
            ));
        }
        Ok(Node::new(NodeKind::VarRef { sym: name.to_string() }, env.clone(), form.clone()))
    }

    fn parse_list(&self, form: &Form, items: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some(head) = items.first() else {
            return Err(err(form, "cannot evaluate an empty list"));
        };
        let args = &items[1..];
        if let Some(op) = head.as_sym() {
            match op {
                "narrow" => return self.parse_narrow(form, args, env),
                "lifting" => return self.parse_lifting(form, args, env),
                "copy" => return self.parse_copy(form, args, env),
                "pack" => return self.parse_pack(form, args, env),
                "unpack" => return self.parse_unpack(form, args, env),
                "chor" => return self.parse_chor(form, args, env),
                "inst" => return self.parse_inst(form, args, env),
                "agree!" => return self.parse_agree(form, args, env),
                "let" => return self.parse_let(form, args, env),
                "do" => {
                    let body = self.parse_body(args, env, form)?;
                    return Ok(Node::new(NodeKind::Do { body }, env.clone(), form.clone()));
                }
                "if" => return self.parse_if(form, args, env),
                "case" => return self.parse_case(form, args, env),
                "fn" => return self.parse_fn(form, args, env),
                "quote" => {
                    let [quoted] = args else {
                        return Err(err(form, "quote takes exactly one form"));
                    };
                    let kind = NodeKind::Quote { form: quoted.clone() };
                    return Ok(Node::new(kind, env.clone(), form.clone()));
                }
                "throw" => {
                    let [expr] = args else {
                        return Err(err(form, "throw takes exactly one expression"));
                    };
                    let expr = Box::new(self.parse(expr, &env.non_tail())?);
                    return Ok(Node::new(NodeKind::Throw { expr }, env.clone(), form.clone()));
                }
                "try" => return self.parse_try(form, args, env),
                "recur" => return self.parse_recur(form, args, env),
                _ => {}
            }
            // Role sugar: (R body…) is (lifting [R] body…).
            if env.is_role(op) && env.lookup(op).is_none() {
                let role = Role::new(op);
                let mask = [role.clone()].into_iter().collect();
                let body = self.parse_body(args, &env.with_mask(mask), form)?;
                let kind = NodeKind::Lifting { roles: vec![role], body };
                return Ok(Node::new(kind, env.clone(), form.clone()));
            }
            // Communication sugar: A=>B copies, A->B copies then narrows.
            if let Some((src, dst)) = split_role_pair(op, "=>", env) {
                let [arg] = args else {
                    return Err(err(form, format!("{op} takes exactly one expression")));
                };
                let expr = Box::new(self.parse(arg, &env.non_tail())?);
                let kind = NodeKind::Copy { src, dst, expr };
                return Ok(Node::new(kind, env.clone(), form.clone()));
            }
            if let Some((src, dst)) = split_role_pair(op, "->", env) {
                let [arg] = args else {
                    return Err(err(form, format!("{op} takes exactly one expression")));
                };
                let expr = Box::new(self.parse(arg, &env.non_tail())?);
                let copy = Node::new(
                    NodeKind::Copy { src, dst: dst.clone(), expr },
                    env.non_tail(),
                    form.clone(),
                );
                let kind = NodeKind::Narrow { roles: vec![dst], expr: Box::new(copy) };
                return Ok(Node::new(kind, env.clone(), form.clone()));
            }
            // Definition sugar: (name [R+] args…) instantiates and invokes.
            // A host builtin of the same name wins in plain call position.
            if env.lookup(op).is_none() && self.ctx.is_defined(op) {
                match args.first().and_then(role_vector(env)) {
                    Some(role_vec) => {
                        let inst = Node::new(
                            NodeKind::Inst { name: op.to_string(), roles: role_vec, check_sig: false },
                            env.non_tail(),
                            head.clone(),
                        );
                        let call_args = self.parse_all(&args[1..], env)?;
                        let kind = NodeKind::Invoke { op: Box::new(inst), args: call_args };
                        return Ok(Node::new(kind, env.clone(), form.clone()));
                    }
                    None if !crate::runtime::interp::is_builtin(op) => {
                        return Err(err(
                            form,
                            format!("choreography {op} must be applied to a vector of roles first"),
                        ));
                    }
                    None => {}
                }
            }
        }
        let op = Box::new(self.parse(head, &env.non_tail())?);
        let call_args = self.parse_all(args, env)?;
        Ok(Node::new(NodeKind::Invoke { op, args: call_args }, env.clone(), form.clone()))
    }

    fn parse_narrow(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let [roles, expr] = args else {
            return Err(err(form, "narrow takes a role vector and one expression"));
        };
        let roles = parse_role_vector(roles)?;
        let expr = Box::new(self.parse(expr, &env.non_tail())?);
        Ok(Node::new(NodeKind::Narrow { roles, expr }, env.clone(), form.clone()))
    }

    fn parse_lifting(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some((roles, body)) = args.split_first() else {
            return Err(err(form, "lifting takes a role vector and a body"));
        };
        let roles = parse_role_vector(roles)?;
        let mask = roles.iter().cloned().collect();
        let body = self.parse_body(body, &env.with_mask(mask), form)?;
        Ok(Node::new(NodeKind::Lifting { roles, body }, env.clone(), form.clone()))
    }

    fn parse_copy(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let [roles, expr] = args else {
            return Err(err(form, "copy takes a [src dst] vector and one expression"));
        };
        let roles = parse_role_vector(roles)?;
        let [src, dst] = roles.as_slice() else {
            return Err(err(form, "copy takes exactly two roles"));
        };
        let expr = Box::new(self.parse(expr, &env.non_tail())?);
        let kind = NodeKind::Copy { src: src.clone(), dst: dst.clone(), expr };
        Ok(Node::new(kind, env.clone(), form.clone()))
    }

    fn parse_pack(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        if args.is_empty() {
            return Err(err(form, "pack takes at least one expression"));
        }
        let exprs = self.parse_all(args, env)?;
        Ok(Node::new(NodeKind::Pack { exprs }, env.clone(), form.clone()))
    }

    fn parse_unpack(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some((bindings, body)) = args.split_first() else {
            return Err(err(form, "unpack takes a binding vector and a body"));
        };
        let Some(pairs) = bindings.as_vector() else {
            return Err(err(bindings, "unpack bindings must be a vector"));
        };
        if pairs.len() % 2 != 0 {
            return Err(err(bindings, "unpack bindings must be binder/expression pairs"));
        }
        self.parse_unpack_pairs(form, pairs, body, env)
    }

    fn parse_unpack_pairs(
        &self,
        form: &Form,
        pairs: &[Form],
        body: &[Form],
        env: &Env,
    ) -> Result<Node, ParseError> {
        let Some((binder_form, rest)) = pairs.split_first() else {
            let body = self.parse_body(body, env, form)?;
            return Ok(Node::new(NodeKind::Do { body }, env.clone(), form.clone()));
        };
        let (init_form, rest) = rest.split_first().expect("pair count checked by caller");
        let binder = parse_binder(binder_form)?;
        let init = Box::new(self.parse(init_form, &env.non_tail())?);
        let mut inner_env = env.clone();
        for (sym, uid, path) in binder.leaves() {
            inner_env.bind(Binding { sym, uid, path, rtype: None });
        }
        let body = if rest.is_empty() {
            self.parse_body(body, &inner_env, form)?
        } else {
            vec![self.parse_unpack_pairs(form, rest, body, &inner_env)?]
        };
        Ok(Node::new(NodeKind::Unpack { binder, init, body }, env.clone(), form.clone()))
    }

    fn parse_chor(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let (name, rest) = match args.first() {
            Some(f) if f.as_sym().is_some() => (f.as_sym().map(String::from), &args[1..]),
            _ => (None, args),
        };
        let Some((sig_form, rest)) = rest.split_first() else {
            return Err(err(form, "chor takes a signature and a parameter vector"));
        };
        let sig = parse_type(sig_form).map_err(|e| err(sig_form, e.reason))?;
        let Type::Chor { .. } = sig else {
            return Err(err(sig_form, "chor signature must be a choreography type"));
        };
        let sig = adjust_signature(sig);
        let Some((params_form, body_forms)) = rest.split_first() else {
            return Err(err(form, "chor is missing its parameter vector"));
        };
        let Some(param_forms) = params_form.as_vector() else {
            return Err(err(params_form, "chor parameters must be a vector"));
        };
        let params = param_forms.iter().map(parse_binder).collect::<Result<Vec<_>, _>>()?;

        let loop_id = crate::ast::env::fresh_loop_id();
        let mut body_env = env.clone();
        body_env.mask = env.roles.iter().cloned().collect();
        body_env.tail = true;
        body_env.loop_id = Some(loop_id);
        if let Some(name) = &name {
            body_env.bind(Binding::new(name.clone()));
        }
        for binder in &params {
            for (sym, uid, path) in binder.leaves() {
                body_env.bind(Binding { sym, uid, path, rtype: None });
            }
        }
        let body = self.parse_body(body_forms, &body_env, form)?;
        let kind = NodeKind::Chor { name, sig, params, body, loop_id, top_level: false };
        Ok(Node::new(kind, env.clone(), form.clone()))
    }

    fn parse_inst(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let [name, roles] = args else {
            return Err(err(form, "inst takes a name and a role vector"));
        };
        let Some(name) = name.as_sym() else {
            return Err(err(name, "inst name must be a symbol"));
        };
        if !self.ctx.is_defined(name) {
            return Err(err(form, format!("unknown choreography {name}")));
        }
        let roles = parse_role_vector(roles)?;
        let kind = NodeKind::Inst { name: name.to_string(), roles, check_sig: false };
        Ok(Node::new(kind, env.clone(), form.clone()))
    }

    fn parse_agree(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        if args.is_empty() {
            return Err(err(form, "agree! takes at least one expression"));
        }
        let exprs = self.parse_all(args, env)?;
        Ok(Node::new(NodeKind::Agree { exprs }, env.clone(), form.clone()))
    }

    fn parse_let(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some((bindings_form, body_forms)) = args.split_first() else {
            return Err(err(form, "let takes a binding vector and a body"));
        };
        let Some(pairs) = bindings_form.as_vector() else {
            return Err(err(bindings_form, "let bindings must be a vector"));
        };
        if pairs.len() % 2 != 0 {
            return Err(err(bindings_form, "let bindings must be symbol/expression pairs"));
        }
        let mut scope = env.clone();
        let mut bindings = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks(2) {
            let Some(sym) = pair[0].as_sym() else {
                return Err(err(&pair[0], "let binder must be a symbol"));
            };
            let init = self.parse(&pair[1], &scope.non_tail())?;
            let binding = Binding::new(sym);
            scope.bind(binding.clone());
            bindings.push((binding, init));
        }
        let body = self.parse_body(body_forms, &scope, form)?;
        Ok(Node::new(NodeKind::Let { bindings, body }, env.clone(), form.clone()))
    }

    fn parse_if(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let (test, then, els) = match args {
            [test, then] => (test, then, None),
            [test, then, els] => (test, then, Some(els)),
            _ => return Err(err(form, "if takes a test, a then branch, and an optional else branch")),
        };
        let test = Box::new(self.parse(test, &env.non_tail())?);
        let then = Box::new(self.parse(then, &env.in_tail())?);
        let els = Box::new(match els {
            Some(f) => self.parse(f, &env.in_tail())?,
            None => Node::new(NodeKind::Const { form: Form::nil() }, env.non_tail(), form.clone()),
        });
        Ok(Node::new(NodeKind::If { test, then, els }, env.clone(), form.clone()))
    }

    fn parse_case(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some((expr, rest)) = args.split_first() else {
            return Err(err(form, "case takes an expression and clauses"));
        };
        let expr = Box::new(self.parse(expr, &env.non_tail())?);
        let mut clauses = Vec::new();
        let mut default = None;
        let mut i = 0;
        while i < rest.len() {
            if i + 1 == rest.len() {
                default = Some(Box::new(self.parse(&rest[i], &env.in_tail())?));
                break;
            }
            let constant = &rest[i];
            if !constant.is_literal() {
                return Err(err(constant, "case test constant must be a literal"));
            }
            clauses.push((constant.clone(), self.parse(&rest[i + 1], &env.in_tail())?));
            i += 2;
        }
        if clauses.is_empty() {
            return Err(err(form, "case needs at least one clause"));
        }
        Ok(Node::new(NodeKind::Case { expr, clauses, default }, env.clone(), form.clone()))
    }

    fn parse_fn(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let (name, rest) = match args.first() {
            Some(f) if f.as_sym().is_some() => (f.as_sym().map(String::from), &args[1..]),
            _ => (None, args),
        };
        let Some((params_form, body_forms)) = rest.split_first() else {
            return Err(err(form, "fn takes a parameter vector and a body"));
        };
        let Some(param_syms) = params_form.as_vector() else {
            return Err(err(params_form, "fn parameters must be a vector"));
        };
        let mut scope = env.clone();
        scope.loop_id = None;
        scope.tail = true;
        let mut params = Vec::with_capacity(param_syms.len());
        for p in param_syms {
            let Some(sym) = p.as_sym() else {
                return Err(err(p, "fn parameter must be a symbol"));
            };
            let binding = Binding::new(sym);
            scope.bind(binding.clone());
            params.push(binding);
        }
        if let Some(name) = &name {
            scope.bind(Binding::new(name.clone()));
        }
        let body = self.parse_body(body_forms, &scope, form)?;
        Ok(Node::new(NodeKind::Fn { name, params, body }, env.clone(), form.clone()))
    }

    fn parse_try(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let mut body = Vec::new();
        let mut catches = Vec::new();
        let mut finally = None;
        for item in args {
            match item.op_sym() {
                Some("catch") => {
                    let clause = item.as_list().expect("op_sym implies a list");
                    let Some(sym) = clause.get(1).and_then(Form::as_sym) else {
                        return Err(err(item, "catch takes a binder symbol and a body"));
                    };
                    let binding = Binding::new(sym);
                    let mut scope = env.non_tail();
                    scope.bind(binding.clone());
                    let handler = self.parse_body(&clause[2..], &scope, item)?;
                    catches.push(CatchClause { sym: binding.sym, uid: binding.uid, body: handler });
                }
                Some("finally") => {
                    let clause = item.as_list().expect("op_sym implies a list");
                    finally = Some(self.parse_body(&clause[1..], &env.non_tail(), item)?);
                }
                _ => {
                    if !catches.is_empty() || finally.is_some() {
                        return Err(err(item, "try body expressions must precede catch and finally"));
                    }
                    body.push(self.parse(item, &env.non_tail())?);
                }
            }
        }
        if body.is_empty() {
            body.push(Node::new(NodeKind::Const { form: Form::nil() }, env.non_tail(), form.clone()));
        }
        Ok(Node::new(NodeKind::Try { body, catches, finally }, env.clone(), form.clone()))
    }

    fn parse_recur(&self, form: &Form, args: &[Form], env: &Env) -> Result<Node, ParseError> {
        let Some(loop_id) = env.loop_id else {
            return Err(err(form, "recur outside of a chor body"));
        };
        if !env.tail {
            return Err(err(form, "recur must be in tail position"));
        }
        let parsed = self.parse_all(args, env)?;
        Ok(Node::new(NodeKind::Recur { args: parsed, loop_id }, env.clone(), form.clone()))
    }
}

/// A vector form of role symbols, all of which are roles under `env`.
fn role_vector(env: &Env) -> impl Fn(&Form) -> Option<Vec<Role>> + '_ {
    move |form| {
        let items = form.as_vector()?;
        if items.is_empty() {
            return None;
        }
        let mut roles = Vec::with_capacity(items.len());
        for item in items {
            let name = item.as_sym()?;
            if !env.is_role(name) {
                return None;
            }
            roles.push(Role::new(name));
        }
        Some(roles)
    }
}

pub(crate) fn parse_role_vector(form: &Form) -> Result<Vec<Role>, ParseError> {
    let Some(items) = form.as_vector() else {
        return Err(err(form, "expected a vector of roles"));
    };
    if items.is_empty() {
        return Err(err(form, "role vector cannot be empty"));
    }
    let mut roles = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.as_sym() else {
            return Err(err(item, "role must be an identifier"));
        };
        roles.push(Role::new(name));
    }
    Ok(roles)
}

fn parse_binder(form: &Form) -> Result<Binder, ParseError> {
    match &form.kind {
        FormKind::Sym(name) => Ok(Binder::sym(name.as_str())),
        FormKind::Vector(items) => {
            if items.is_empty() {
                return Err(err(form, "binder vector cannot be empty"));
            }
            let inner = items.iter().map(parse_binder).collect::<Result<Vec<_>, _>>()?;
            Ok(Binder::Vec(inner))
        }
        _ => Err(err(form, "binder must be a symbol or a vector of binders")),
    }
}

/// Split an operator like `A=>B` into two roles, when both are in scope.
fn split_role_pair(op: &str, sep: &str, env: &Env) -> Option<(Role, Role)> {
    let (left, right) = op.split_once(sep)?;
    if left.is_empty() || right.is_empty() {
        return None;
    }
    if env.is_role(left) && env.is_role(right) {
        Some((Role::new(left), Role::new(right)))
    } else {
        None
    }
}

/// Rewrite nested choreography types in a signature whose aux is left
/// unspecified to the empty set; the top level is preserved as written.
pub fn adjust_signature(sig: Type) -> Type {
    fn adjust_nested(t: Type) -> Type {
        match t {
            Type::Chor { params, ret, aux } => {
                let aux = match aux {
                    Aux::Unspecified => Aux::Roles(Default::default()),
                    concrete => concrete,
                };
                Type::Chor {
                    params: params.into_iter().map(adjust_nested).collect(),
                    ret: Box::new(adjust_nested(*ret)),
                    aux,
                }
            }
            Type::Tuple { elems } => {
                Type::Tuple { elems: elems.into_iter().map(adjust_nested).collect() }
            }
            agree => agree,
        }
    }
    match sig {
        Type::Chor { params, ret, aux } => Type::Chor {
            params: params.into_iter().map(adjust_nested).collect(),
            ret: Box::new(adjust_nested(*ret)),
            aux,
        },
        other => other,
    }
}
