// Endpoint projection
//
// Per-role emission of host forms from a checked AST, synthesizing send and
// receive actions and dropping sub-expressions irrelevant to the target
// role. Communication order within a role is fixed by the textual
// left-to-right order of sub-expressions; ordering across kept values and
// effect-only siblings is preserved by binding intermediate results in a
// `let`.

use thiserror::Error;

use crate::ast::env::{fresh_uid, Binder};
use crate::ast::node::{Node, NodeKind};
use crate::ast::role::Role;
use crate::ast::types::Type;
use crate::compiler::registry::{Context, Warning};
use crate::config::SignatureVerify;
use crate::form::{Form, FormKind};

/// Internal projection invariant violation.
#[derive(Debug, Error)]
#[error("projection error in {form}: {reason}")]
pub struct ProjectionError {
    pub reason: String,
    pub form: Form,
}

fn err(node: &Node, reason: impl Into<String>) -> ProjectionError {
    ProjectionError { reason: reason.into(), form: node.form.clone() }
}

/// The sentinel projected value denoting "no result at this role".
pub fn noop_form() -> Form {
    Form::sym("noop")
}

pub fn is_noop(form: &Form) -> bool {
    form.is_sym("noop")
}

/// Project `node` for `role`. `def_roles` is the defining choreography's
/// role vector, the locator index space of emitted sends and receives.
pub fn project(
    ctx: &Context,
    def_roles: &[Role],
    node: &Node,
    role: &Role,
) -> Result<Form, ProjectionError> {
    Projector { ctx, roles: def_roles, role }.node(node)
}

/// An ordered sub-expression slot: a value the role keeps, or an effect it
/// merely runs.
enum Slot {
    Value(Form),
    Effect(Form),
}

struct Projector<'a> {
    ctx: &'a Context,
    roles: &'a [Role],
    role: &'a Role,
}

impl Projector<'_> {
    fn idx(&self, node: &Node, role: &Role) -> Result<i64, ProjectionError> {
        self.roles
            .iter()
            .position(|r| r == role)
            .map(|i| i as i64)
            .ok_or_else(|| err(node, format!("role {role} has no locator index")))
    }

    /// Wrap effects around a result, in order.
    fn seq(mut effects: Vec<Form>, result: Form) -> Form {
        if effects.is_empty() {
            result
        } else {
            let mut items = vec![Form::sym("do")];
            items.append(&mut effects);
            items.push(result);
            Form::list(items)
        }
    }

    /// Effect statements for a node: nothing when the role is not involved.
    fn effects_only(&self, node: &Node) -> Result<Vec<Form>, ProjectionError> {
        if !node.mentions(self.role) {
            return Ok(Vec::new());
        }
        let form = self.node(node)?;
        if is_noop(&form) {
            Ok(Vec::new())
        } else {
            Ok(vec![form])
        }
    }

    /// Project a body: leading expressions become effects, the last one the
    /// value.
    fn body(&self, nodes: &[Node]) -> Result<Form, ProjectionError> {
        let (last, init) = nodes.split_last().expect("bodies are never empty");
        let mut effects = Vec::new();
        for child in init {
            effects.extend(self.effects_only(child)?);
        }
        Ok(Self::seq(effects, self.node(last)?))
    }

    /// Classify children into kept values and effects, preserving order.
    fn slots<'n>(&self, nodes: impl IntoIterator<Item = &'n Node>) -> Result<Vec<Slot>, ProjectionError> {
        let mut out = Vec::new();
        for node in nodes {
            if !node.mentions(self.role) {
                continue;
            }
            let form = self.node(node)?;
            if node.has_result(self.role) {
                out.push(Slot::Value(form));
            } else if !is_noop(&form) {
                out.push(Slot::Effect(form));
            }
        }
        Ok(out)
    }

    /// Reassemble slots into `build(values)`, binding intermediates in a
    /// `let` whenever effects interleave with kept values.
    fn assemble(slots: Vec<Slot>, build: impl FnOnce(Vec<Form>) -> Form) -> Form {
        let any_effect = slots.iter().any(|s| matches!(s, Slot::Effect(_)));
        if !any_effect {
            let values = slots
                .into_iter()
                .map(|s| match s {
                    Slot::Value(f) => f,
                    Slot::Effect(_) => unreachable!(),
                })
                .collect();
            return build(values);
        }
        let mut bindings = Vec::new();
        let mut values = Vec::new();
        for slot in slots {
            match slot {
                Slot::Value(f) => {
                    let temp = fresh_uid("%v");
                    bindings.push(Form::sym(temp.clone()));
                    bindings.push(f);
                    values.push(Form::sym(temp));
                }
                Slot::Effect(f) => {
                    bindings.push(Form::sym("_"));
                    bindings.push(f);
                }
            }
        }
        Form::list(vec![Form::sym("let"), Form::vector(bindings), build(values)])
    }

    fn node(&self, node: &Node) -> Result<Form, ProjectionError> {
        if !node.mentions(self.role) {
            return Ok(noop_form());
        }
        match &node.kind {
            NodeKind::Narrow { expr, .. } => {
                if node.has_result(self.role) {
                    self.node(expr)
                } else {
                    Ok(Self::seq(self.effects_only(expr)?, noop_form()))
                }
            }

            NodeKind::Lifting { body, .. } => self.body(body),

            NodeKind::Copy { src, dst, expr } => {
                if self.role == src {
                    let dst_idx = self.idx(node, dst)?;
                    Ok(Form::list(vec![Form::sym("send!"), Form::int(dst_idx), self.node(expr)?]))
                } else if self.role == dst {
                    let src_idx = self.idx(node, src)?;
                    let recv = Form::list(vec![Form::sym("recv!"), Form::int(src_idx)]);
                    Ok(Self::seq(self.effects_only(expr)?, recv))
                } else {
                    self.node(expr)
                }
            }

            NodeKind::Pack { exprs } => {
                let any_kept = exprs.iter().any(|e| e.has_result(self.role));
                let slots = self.slots(exprs.iter())?;
                if !any_kept {
                    let effects = slots
                        .into_iter()
                        .map(|s| match s {
                            Slot::Effect(f) | Slot::Value(f) => f,
                        })
                        .collect();
                    return Ok(Self::seq(effects, noop_form()));
                }
                Ok(Self::assemble(slots, Form::vector))
            }

            NodeKind::Unpack { binder, init, body } => {
                let init_type = init.rtype.as_ref().ok_or_else(|| err(node, "unpack initializer untyped"))?;
                match self.binder(binder, init_type) {
                    Some(pattern) => {
                        let init_form = self.node(init)?;
                        let body_form = self.body(body)?;
                        Ok(Form::list(vec![
                            Form::sym("let"),
                            Form::vector(vec![pattern, init_form]),
                            body_form,
                        ]))
                    }
                    None => Ok(Self::seq(self.effects_only(init)?, self.body(body)?)),
                }
            }

            NodeKind::Chor { sig, params, body, .. } => self.chor(node, sig, params, body),

            NodeKind::Inst { name, roles, check_sig } => self.inst(node, name, roles, *check_sig),

            NodeKind::Agree { exprs } => {
                let slots = self.slots(exprs.iter())?;
                Ok(Self::assemble(slots, |values| {
                    values.into_iter().next().unwrap_or_else(noop_form)
                }))
            }

            NodeKind::Let { bindings, body } => {
                let mut pairs = Vec::new();
                for (binding, init) in bindings {
                    if !init.mentions(self.role) {
                        continue;
                    }
                    let form = self.node(init)?;
                    if init.has_result(self.role) {
                        pairs.push(Form::sym(binding.uid.clone()));
                        pairs.push(form);
                    } else if !is_noop(&form) {
                        pairs.push(Form::sym("_"));
                        pairs.push(form);
                    }
                }
                let body_form = self.body(body)?;
                if pairs.is_empty() {
                    Ok(body_form)
                } else {
                    Ok(Form::list(vec![Form::sym("let"), Form::vector(pairs), body_form]))
                }
            }

            NodeKind::Do { body } => self.body(body),

            NodeKind::If { test, then, els } => {
                let branches_mentioned = then.mentions(self.role) || els.mentions(self.role);
                if test.has_result(self.role) && branches_mentioned {
                    Ok(Form::list(vec![
                        Form::sym("if"),
                        self.node(test)?,
                        self.node(then)?,
                        self.node(els)?,
                    ]))
                } else {
                    Ok(Self::seq(self.effects_only(test)?, noop_form()))
                }
            }

            NodeKind::Case { expr, clauses, default } => {
                let branches_mentioned = clauses.iter().any(|(_, b)| b.mentions(self.role))
                    || default.as_ref().is_some_and(|d| d.mentions(self.role));
                if expr.has_result(self.role) && branches_mentioned {
                    let mut items = vec![Form::sym("case"), self.node(expr)?];
                    for (constant, branch) in clauses {
                        items.push(constant.clone());
                        items.push(self.node(branch)?);
                    }
                    if let Some(default) = default {
                        items.push(self.node(default)?);
                    }
                    Ok(Form::list(items))
                } else {
                    Ok(Self::seq(self.effects_only(expr)?, noop_form()))
                }
            }

            NodeKind::Fn { name, params, body } => {
                let mut items = vec![Form::sym("fn")];
                if let Some(name) = name {
                    let fn_name = body
                        .first()
                        .and_then(|n| n.env.lookup(name))
                        .map(|b| b.uid.clone())
                        .unwrap_or_else(|| name.clone());
                    items.push(Form::sym(fn_name));
                }
                items.push(Form::vector(params.iter().map(|p| Form::sym(p.uid.clone())).collect()));
                items.push(self.body(body)?);
                Ok(Form::list(items))
            }

            NodeKind::Invoke { op, args } => self.invoke(node, op, args),

            NodeKind::Recur { args, .. } => {
                let slots = self.slots(args.iter())?;
                Ok(Self::assemble(slots, |values| {
                    let mut items = vec![Form::sym("recur")];
                    items.extend(values);
                    Form::list(items)
                }))
            }

            NodeKind::Local { uid, .. } => Ok(Form::sym(uid.clone())),

            NodeKind::VarRef { sym } => Ok(Form::sym(sym.clone())),

            NodeKind::Quote { form } => Ok(Form::list(vec![Form::sym("quote"), form.clone()])),

            NodeKind::Const { form } => Ok(form.clone()),

            NodeKind::VectorLit { items } => {
                if !node.has_result(self.role) {
                    let effects = items.iter().map(|i| self.effects_only(i)).collect::<Result<Vec<_>, _>>()?;
                    return Ok(Self::seq(effects.into_iter().flatten().collect(), noop_form()));
                }
                let slots = self.slots(items.iter())?;
                Ok(Self::assemble(slots, Form::vector))
            }

            NodeKind::SetLit { items } => {
                self.warn_unordered(node, items.iter().collect::<Vec<_>>())?;
                if !node.has_result(self.role) {
                    let effects = items.iter().map(|i| self.effects_only(i)).collect::<Result<Vec<_>, _>>()?;
                    return Ok(Self::seq(effects.into_iter().flatten().collect(), noop_form()));
                }
                let slots = self.slots(items.iter())?;
                Ok(Self::assemble(slots, Form::set))
            }

            NodeKind::MapLit { pairs } => {
                let flat: Vec<&Node> = pairs.iter().flat_map(|(k, v)| [k, v]).collect();
                self.warn_unordered(node, flat.clone())?;
                if !node.has_result(self.role) {
                    let mut effects = Vec::new();
                    for entry in &flat {
                        effects.extend(self.effects_only(entry)?);
                    }
                    return Ok(Self::seq(effects, noop_form()));
                }
                let slots = self.slots(flat.into_iter())?;
                Ok(Self::assemble(slots, |values| {
                    let mut pairs = Vec::with_capacity(values.len() / 2);
                    let mut iter = values.into_iter();
                    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                        pairs.push((k, v));
                    }
                    Form::map(pairs)
                }))
            }

            NodeKind::Throw { expr } => {
                if node.has_result(self.role) {
                    let value = if expr.has_result(self.role) { self.node(expr)? } else { noop_form() };
                    let effects = if expr.has_result(self.role) {
                        Vec::new()
                    } else {
                        self.effects_only(expr)?
                    };
                    Ok(Self::seq(effects, Form::list(vec![Form::sym("throw"), value])))
                } else {
                    Ok(Self::seq(self.effects_only(expr)?, noop_form()))
                }
            }

            NodeKind::Try { body, catches, finally } => {
                let mut items = vec![Form::sym("try"), self.body(body)?];
                for catch in catches {
                    let mut clause = vec![Form::sym("catch"), Form::sym(catch.uid.clone())];
                    clause.push(self.body(&catch.body)?);
                    items.push(Form::list(clause));
                }
                if let Some(fin) = finally {
                    let mut clause = vec![Form::sym("finally")];
                    clause.push(self.body(fin)?);
                    items.push(Form::list(clause));
                }
                Ok(Form::list(items))
            }
        }
    }

    /// Projected binder: keep only positions whose type has a result for
    /// the target role. Emitted variables use the binding's unique name.
    fn binder(&self, binder: &Binder, rtype: &Type) -> Option<Form> {
        match binder {
            Binder::Sym { uid, .. } => {
                if rtype.roles_of().contains(self.role) {
                    Some(Form::sym(uid.clone()))
                } else {
                    None
                }
            }
            Binder::Vec(items) => {
                let Type::Tuple { elems } = rtype else {
                    return None;
                };
                let kept: Vec<Form> = items
                    .iter()
                    .zip(elems)
                    .filter_map(|(b, t)| self.binder(b, t))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(Form::vector(kept))
                }
            }
        }
    }

    fn chor(
        &self,
        node: &Node,
        sig: &Type,
        params: &[Binder],
        body: &[Node],
    ) -> Result<Form, ProjectionError> {
        let Type::Chor { params: sig_params, .. } = sig else {
            return Err(err(node, "chor node without a choreography signature"));
        };
        let mut param_forms = Vec::new();
        for (binder, ptype) in params.iter().zip(sig_params) {
            if let Some(pattern) = self.binder(binder, ptype) {
                param_forms.push(pattern);
            }
        }
        let body_form = self.body(body)?;
        Ok(Form::list(vec![Form::sym("fn"), Form::vector(param_forms), body_form]))
    }

    fn inst(
        &self,
        node: &Node,
        name: &str,
        roles: &[Role],
        check_sig: bool,
    ) -> Result<Form, ProjectionError> {
        let Some(def) = self.ctx.lookup(name) else {
            return Err(err(node, format!("unknown choreography {name}")));
        };
        let Some(pos) = roles.iter().position(|r| r == self.role) else {
            return Ok(noop_form());
        };
        let mut mapping = Vec::with_capacity(roles.len());
        for role in roles {
            mapping.push(Form::int(self.idx(node, role)?));
        }
        let mut items = vec![
            Form::sym("make-proj"),
            Form::list(vec![Form::sym("quote"), Form::sym(name)]),
            Form::int(pos as i64),
            Form::vector(mapping),
        ];
        if check_sig {
            let mode = match self.ctx.opts().verify_signature {
                SignatureVerify::Off | SignatureVerify::Block => Form::keyword("block"),
                SignatureVerify::Warn => Form::keyword("warn"),
            };
            items.push(Form::string(def.positional_signature().rendered()));
            items.push(mode);
        }
        Ok(Form::list(items))
    }

    fn invoke(&self, node: &Node, op: &Node, args: &[Node]) -> Result<Form, ProjectionError> {
        let op_type = op.rtype.as_ref().ok_or_else(|| err(node, "operator untyped"))?;
        let participates = op_type.roles_of().contains(self.role);
        if !participates {
            let mut effects = self.effects_only(op)?;
            for arg in args {
                effects.extend(self.effects_only(arg)?);
            }
            return Ok(Self::seq(effects, noop_form()));
        }
        let mut slots = vec![Slot::Value(self.node(op)?)];
        slots.extend(self.slots(args.iter())?);
        Ok(Self::assemble(slots, |values| Form::list(values)))
    }

    /// Unordered collections whose elements communicate in more than one
    /// place have a non-deterministic communication order.
    fn warn_unordered(&self, node: &Node, items: Vec<&Node>) -> Result<(), ProjectionError> {
        let communicating = items
            .iter()
            .filter(|n| {
                n.mentions(self.role)
                    && self.node(n).map(|f| contains_comm(&f)).unwrap_or(false)
            })
            .count();
        if communicating > 1 {
            self.ctx.warn(Warning::UnorderedCommunication { form: node.form.to_string() });
        }
        Ok(())
    }
}

fn contains_comm(form: &Form) -> bool {
    match &form.kind {
        FormKind::Sym(_) => false,
        FormKind::List(items) => {
            items.first().is_some_and(|h| h.is_sym("send!") || h.is_sym("recv!"))
                || items.iter().any(contains_comm)
        }
        FormKind::Vector(items) | FormKind::Set(items) => items.iter().any(contains_comm),
        FormKind::Map(pairs) => pairs.iter().any(|(k, v)| contains_comm(k) || contains_comm(v)),
        _ => false,
    }
}
