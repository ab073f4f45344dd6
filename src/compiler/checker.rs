// Choreographic type inference and checking
//
// Bidirectional: signatures provide checking for chor parameters and
// returns, everything else is inferred. The checker runs post-order over
// children, extending the typing environment as bindings are introduced,
// and fills in `rtype` and `rmentions` on every node.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::env::Binder;
use crate::ast::node::{Node, NodeKind};
use crate::ast::role::{Role, RoleSet};
use crate::ast::types::{parse_type, Aux, Type};
use crate::compiler::registry::{Context, Warning};
use crate::form::{Form, Span};

/// A contract violation in the type checker.
#[derive(Debug, Error)]
#[error("type error in {form}: {reason}")]
pub struct TypeError {
    pub reason: String,
    pub form: Form,
    pub span: Option<Span>,
}

fn err(node: &Node, reason: impl Into<String>) -> TypeError {
    TypeError { reason: reason.into(), form: node.form.clone(), span: node.span() }
}

struct LoopFrame {
    params: Vec<Type>,
    ret: Type,
}

pub struct Checker<'a> {
    ctx: &'a Context,
    /// Binding uid to checked type.
    types: HashMap<String, Type>,
    loops: HashMap<u64, LoopFrame>,
}

/// Type-check a tree in place.
pub fn check(ctx: &Context, node: &mut Node) -> Result<(), TypeError> {
    Checker::new(ctx).check_node(node)
}

impl<'a> Checker<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Checker { ctx, types: HashMap::new(), loops: HashMap::new() }
    }

    fn mask_type(node: &Node) -> Type {
        Type::Agree { roles: node.env.mask.clone() }
    }

    fn agree_roles<'n>(&self, node: &'n Node, what: &str) -> Result<&'n RoleSet, TypeError> {
        match node.rtype.as_ref() {
            Some(Type::Agree { roles }) => Ok(roles),
            Some(other) => Err(err(
                node,
                format!("{what} must be an agreement, found {}", other.rendered()),
            )),
            None => Err(err(node, format!("{what} has no inferred type"))),
        }
    }

    fn check_body(&mut self, body: &mut [Node]) -> Result<(Type, RoleSet), TypeError> {
        let mut mentions = RoleSet::new();
        let mut last = None;
        for child in body.iter_mut() {
            self.check_node(child)?;
            mentions.extend(child.rmentions.iter().cloned());
            last = child.rtype.clone();
        }
        let Some(rtype) = last else {
            unreachable!("parser guarantees non-empty bodies");
        };
        Ok((rtype, mentions))
    }

    /// Assign types to the leaves of a binder from the value type at each
    /// position path.
    fn assign_binder(&mut self, node: &Node, binder: &Binder, rtype: &Type) -> Result<(), TypeError> {
        match binder {
            Binder::Sym { uid, .. } => {
                self.types.insert(uid.clone(), rtype.clone());
                Ok(())
            }
            Binder::Vec(items) => {
                let Type::Tuple { elems } = rtype else {
                    return Err(err(
                        node,
                        format!("binder destructures a tuple, found {}", rtype.rendered()),
                    ));
                };
                if elems.len() != items.len() {
                    return Err(err(
                        node,
                        format!("binder has {} positions, tuple has {}", items.len(), elems.len()),
                    ));
                }
                for (item, elem) in items.iter().zip(elems) {
                    self.assign_binder(node, item, elem)?;
                }
                Ok(())
            }
        }
    }

    pub fn check_node(&mut self, node: &mut Node) -> Result<(), TypeError> {
        node.env.annotate_locals(&self.types);
        let (rtype, rmentions) = self.infer(node)?;
        node.rtype = Some(rtype);
        node.rmentions = rmentions;
        Ok(())
    }

    fn infer(&mut self, node: &mut Node) -> Result<(Type, RoleSet), TypeError> {
        // Split the kind out so per-variant logic can borrow the node for
        // diagnostics while mutating children.
        let mut kind = std::mem::replace(&mut node.kind, NodeKind::Do { body: Vec::new() });
        let out = self.infer_kind(node, &mut kind);
        node.kind = kind;
        out
    }

    fn infer_kind(&mut self, node: &Node, kind: &mut NodeKind) -> Result<(Type, RoleSet), TypeError> {
        match kind {
            NodeKind::Narrow { roles, expr } => {
                self.check_node(expr)?;
                let source = self.agree_roles(expr, "narrow expression")?.clone();
                for role in roles.iter() {
                    if !source.contains(role) {
                        return Err(err(
                            node,
                            format!("cannot narrow to {role}: not part of the agreement {}", Type::Agree { roles: source.clone() }.rendered()),
                        ));
                    }
                }
                let rtype = Type::Agree { roles: roles.iter().cloned().collect() };
                let mentions = union(rtype.roles_of(), &expr.rmentions);
                Ok((rtype, mentions))
            }

            NodeKind::Lifting { body, .. } => {
                // Pass-through type; a pure lifting does not by itself
                // mention its roles.
                let (rtype, mentions) = self.check_body(body)?;
                Ok((rtype, mentions))
            }

            NodeKind::Copy { src, dst, expr } => {
                self.check_node(expr)?;
                let source = self.agree_roles(expr, "copy expression")?.clone();
                if !source.contains(src) {
                    return Err(err(node, format!("copy source {src} does not hold the value")));
                }
                if source.contains(dst) {
                    return Err(err(node, format!("copy destination {dst} already holds the value")));
                }
                let mut roles = source;
                roles.insert(dst.clone());
                let rtype = Type::Agree { roles };
                let mentions = union(rtype.roles_of(), &expr.rmentions);
                Ok((rtype, mentions))
            }

            NodeKind::Pack { exprs } => {
                let mut elems = Vec::with_capacity(exprs.len());
                let mut mentions = RoleSet::new();
                for expr in exprs.iter_mut() {
                    self.check_node(expr)?;
                    elems.push(expr.rtype.clone().expect("checked above"));
                    mentions.extend(expr.rmentions.iter().cloned());
                }
                let rtype = Type::Tuple { elems };
                let mentions = union(rtype.roles_of(), &mentions);
                Ok((rtype, mentions))
            }

            NodeKind::Unpack { binder, init, body } => {
                self.check_node(init)?;
                let init_type = init.rtype.clone().expect("checked above");
                if !matches!(init_type, Type::Tuple { .. }) {
                    return Err(err(
                        node,
                        format!("unpack initializer must be a tuple, found {}", init_type.rendered()),
                    ));
                }
                self.assign_binder(node, binder, &init_type)?;
                let (rtype, body_mentions) = self.check_body(body)?;
                let mut mentions = union(rtype.roles_of(), &body_mentions);
                mentions.extend(init.rmentions.iter().cloned());
                Ok((rtype, mentions))
            }

            NodeKind::Chor { name, sig, params, body, loop_id, top_level } => {
                self.check_chor(node, name.as_deref(), sig, params, body, *loop_id, *top_level)
            }

            NodeKind::Inst { name, roles, .. } => {
                let Some(def) = self.ctx.lookup(name) else {
                    return Err(err(node, format!("unknown choreography {name}")));
                };
                if def.roles.len() != roles.len() {
                    return Err(err(
                        node,
                        format!("{name} takes {} roles, {} given", def.roles.len(), roles.len()),
                    ));
                }
                let subst: HashMap<Role, Role> = def
                    .roles
                    .iter()
                    .cloned()
                    .zip(roles.iter().cloned())
                    .collect();
                let rtype = def.signature.clone().substitute(&subst).normalize();
                let mentions = roles.iter().cloned().collect();
                Ok((rtype, mentions))
            }

            NodeKind::Agree { exprs } => {
                let mut union_roles = RoleSet::new();
                let mut mentions = RoleSet::new();
                for expr in exprs.iter_mut() {
                    self.check_node(expr)?;
                    let roles = self.agree_roles(expr, "agree! expression")?;
                    if roles.iter().any(|r| union_roles.contains(r)) {
                        return Err(err(node, "agree! expressions must have disjoint agreements"));
                    }
                    union_roles.extend(roles.iter().cloned());
                    mentions.extend(expr.rmentions.iter().cloned());
                }
                let rtype = Type::Agree { roles: union_roles };
                let mentions = union(rtype.roles_of(), &mentions);
                Ok((rtype, mentions))
            }

            NodeKind::Let { bindings, body } => {
                let mut mentions = RoleSet::new();
                for (binding, init) in bindings.iter_mut() {
                    self.check_node(init)?;
                    self.types.insert(binding.uid.clone(), init.rtype.clone().expect("checked above"));
                    binding.rtype = init.rtype.clone();
                    mentions.extend(init.rmentions.iter().cloned());
                }
                let (rtype, body_mentions) = self.check_body(body)?;
                mentions.extend(body_mentions);
                Ok((rtype.clone(), union(rtype.roles_of(), &mentions)))
            }

            NodeKind::Do { body } => {
                let (rtype, mentions) = self.check_body(body)?;
                Ok((rtype.clone(), union(rtype.roles_of(), &mentions)))
            }

            NodeKind::If { test, then, els } => {
                self.check_node(test)?;
                let guard = self.agree_roles(test, "if guard")?.clone();
                self.check_node(then)?;
                self.check_node(els)?;
                let then_t = normalized(then);
                let els_t = normalized(els);
                if then_t != els_t {
                    return Err(err(
                        node,
                        format!(
                            "if branches disagree: {} versus {}",
                            then_t.rendered(),
                            els_t.rendered()
                        ),
                    ));
                }
                // Knowledge of choice: everyone involved in the whole
                // conditional must hold a copy of the guard.
                let mut involved = test.rmentions.clone();
                involved.extend(then.rmentions.iter().cloned());
                involved.extend(els.rmentions.iter().cloned());
                if let Some(outsider) = involved.iter().find(|r| !guard.contains(*r)) {
                    return Err(err(
                        node,
                        format!("role {outsider} takes part in the conditional without knowing the choice"),
                    ));
                }
                let mentions = union(then_t.roles_of(), &involved);
                Ok((then_t, mentions))
            }

            NodeKind::Case { expr, clauses, default } => {
                self.check_node(expr)?;
                let guard = self.agree_roles(expr, "case guard")?.clone();
                let mut branch_type: Option<Type> = None;
                let mut branch_mentions = RoleSet::new();
                for (_, branch) in clauses.iter_mut() {
                    self.check_node(branch)?;
                    let t = normalized(branch);
                    if let Some(seen) = &branch_type {
                        if *seen != t {
                            return Err(err(
                                node,
                                format!("case branches disagree: {} versus {}", seen.rendered(), t.rendered()),
                            ));
                        }
                    } else {
                        branch_type = Some(t);
                    }
                    branch_mentions.extend(branch.rmentions.iter().cloned());
                }
                if let Some(default) = default {
                    self.check_node(default)?;
                    let t = normalized(default);
                    if branch_type.as_ref().is_some_and(|seen| *seen != t) {
                        return Err(err(node, "case default disagrees with the clause type"));
                    }
                    branch_mentions.extend(default.rmentions.iter().cloned());
                }
                let rtype = branch_type.expect("parser requires at least one clause");
                let mut involved = expr.rmentions.clone();
                involved.extend(branch_mentions);
                if let Some(outsider) = involved.iter().find(|r| !guard.contains(*r)) {
                    return Err(err(
                        node,
                        format!("role {outsider} takes part in the case without knowing the choice"),
                    ));
                }
                let mentions = union(rtype.roles_of(), &involved);
                Ok((rtype, mentions))
            }

            NodeKind::Fn { name, params, body } => {
                let mask_type = Self::mask_type(node);
                for param in params.iter_mut() {
                    self.types.insert(param.uid.clone(), mask_type.clone());
                    param.rtype = Some(mask_type.clone());
                }
                if let Some(name) = name {
                    if let Some(binding) = body.first().and_then(|n| n.env.lookup(name)) {
                        self.types.insert(binding.uid.clone(), mask_type.clone());
                    }
                }
                let (_, _) = self.check_body(body)?;
                // Host functions are homogeneous: everything inside them
                // lives at the current mask.
                let mut offender = None;
                for child in body.iter() {
                    child.postorder(&mut |n| {
                        if offender.is_none() && n.rtype.as_ref() != Some(&mask_type) {
                            offender = Some(n.form.clone());
                        }
                    });
                }
                if let Some(form) = offender {
                    return Err(err(
                        node,
                        format!("fn body must stay at the mask {}; {form} does not", mask_type.rendered()),
                    ));
                }
                Ok((mask_type.clone(), mask_type.roles_of()))
            }

            NodeKind::Invoke { op, args } => self.check_invoke(node, op, args),

            NodeKind::Recur { args, loop_id } => {
                for arg in args.iter_mut() {
                    self.check_node(arg)?;
                }
                let Some(frame) = self.loops.get(loop_id) else {
                    return Err(err(node, "recur has no enclosing chor"));
                };
                if frame.params.len() != args.len() {
                    return Err(err(
                        node,
                        format!("recur takes {} arguments, {} given", frame.params.len(), args.len()),
                    ));
                }
                for (arg, expected) in args.iter().zip(&frame.params) {
                    let found = normalized(arg);
                    if found != expected.clone().normalize() {
                        return Err(err(
                            arg,
                            format!("recur argument is {}, expected {}", found.rendered(), expected.rendered()),
                        ));
                    }
                }
                let rtype = frame.ret.clone();
                let mut mentions = rtype.roles_of();
                for arg in args.iter() {
                    mentions.extend(arg.rmentions.iter().cloned());
                }
                Ok((rtype, mentions))
            }

            NodeKind::Local { sym, uid } => {
                let Some(rtype) = self.types.get(uid.as_str()).cloned() else {
                    return Err(err(node, format!("local {sym} has no recorded type")));
                };
                let mentions = rtype.roles_of();
                Ok((rtype, mentions))
            }

            NodeKind::VarRef { sym } => {
                if self.ctx.is_defined(sym) && !crate::runtime::interp::is_builtin(sym) {
                    return Err(err(
                        node,
                        format!("choreography {sym} must be instantiated with inst before use"),
                    ));
                }
                let rtype = Self::mask_type(node);
                let mentions = rtype.roles_of();
                Ok((rtype, mentions))
            }

            NodeKind::Quote { .. } | NodeKind::Const { .. } => {
                let rtype = Self::mask_type(node);
                let mentions = rtype.roles_of();
                Ok((rtype, mentions))
            }

            NodeKind::VectorLit { items } | NodeKind::SetLit { items } => {
                let mask_type = Self::mask_type(node);
                let mut mentions = mask_type.roles_of();
                for item in items.iter_mut() {
                    self.check_node(item)?;
                    if normalized(item) != mask_type {
                        return Err(err(
                            item,
                            format!("collection element must be at the mask {}", mask_type.rendered()),
                        ));
                    }
                    mentions.extend(item.rmentions.iter().cloned());
                }
                Ok((mask_type, mentions))
            }

            NodeKind::MapLit { pairs } => {
                let mask_type = Self::mask_type(node);
                let mut mentions = mask_type.roles_of();
                for (k, v) in pairs.iter_mut() {
                    self.check_node(k)?;
                    self.check_node(v)?;
                    for entry in [&*k, &*v] {
                        if normalized(entry) != mask_type {
                            return Err(err(
                                entry,
                                format!("map entry must be at the mask {}", mask_type.rendered()),
                            ));
                        }
                        mentions.extend(entry.rmentions.iter().cloned());
                    }
                }
                Ok((mask_type, mentions))
            }

            NodeKind::Throw { expr } => {
                self.check_node(expr)?;
                let rtype = Self::mask_type(node);
                let mentions = union(rtype.roles_of(), &expr.rmentions);
                Ok((rtype, mentions))
            }

            NodeKind::Try { body, catches, finally } => {
                let (rtype, mut mentions) = self.check_body(body)?;
                let rtype = rtype.normalize();
                for catch in catches.iter_mut() {
                    let mask_type = Self::mask_type(node);
                    self.types.insert(catch.uid.clone(), mask_type);
                    let (catch_type, catch_mentions) = self.check_body(&mut catch.body)?;
                    if catch_type.normalize() != rtype {
                        return Err(err(
                            node,
                            "catch body must have the same type as the try body",
                        ));
                    }
                    mentions.extend(catch_mentions);
                }
                if let Some(fin) = finally {
                    let (_, fin_mentions) = self.check_body(fin)?;
                    mentions.extend(fin_mentions);
                }
                Ok((rtype.clone(), union(rtype.roles_of(), &mentions)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_chor(
        &mut self,
        node: &Node,
        name: Option<&str>,
        sig: &Type,
        params: &[Binder],
        body: &mut Vec<Node>,
        loop_id: u64,
        top_level: bool,
    ) -> Result<(Type, RoleSet), TypeError> {
        let Type::Chor { params: sig_params, ret, aux } = sig else {
            return Err(err(node, "chor signature must be a choreography type"));
        };
        if !top_level && *aux == Aux::Unspecified {
            return Err(err(
                node,
                "a nested chor signature must specify its auxiliary roles (use | 0 for none)",
            ));
        }
        if sig_params.len() != params.len() {
            return Err(err(
                node,
                format!("signature has {} parameters, {} bound", sig_params.len(), params.len()),
            ));
        }
        let param_uids: Vec<String> =
            params.iter().flat_map(|b| b.leaves().into_iter().map(|(_, uid, _)| uid)).collect();
        for (binder, ptype) in params.iter().zip(sig_params) {
            self.assign_binder(node, binder, ptype)?;
        }
        if let Some(name) = name {
            if let Some(binding) = body.first().and_then(|n| n.env.lookup(name)) {
                if !param_uids.contains(&binding.uid) {
                    self.types.insert(binding.uid.clone(), sig.clone().normalize());
                }
            }
        }
        self.loops.insert(loop_id, LoopFrame { params: sig_params.clone(), ret: (**ret).clone() });

        let (body_type, body_mentions) = self.check_body(body)?;
        let expected = (**ret).clone().normalize();
        if body_type.clone().normalize() != expected {
            return Err(err(
                node,
                format!("body is {}, signature returns {}", body_type.rendered(), ret.rendered()),
            ));
        }

        let primary = sig.primary_roles();
        let computed: RoleSet = body_mentions.difference(&primary).cloned().collect();
        match aux {
            Aux::Roles(declared) => {
                let declared: RoleSet = declared.difference(&primary).cloned().collect();
                if declared != computed {
                    return Err(err(
                        node,
                        format!(
                            "auxiliary roles mismatch: declared {:?}, body involves {:?}",
                            declared.iter().map(Role::name).collect::<Vec<_>>(),
                            computed.iter().map(Role::name).collect::<Vec<_>>()
                        ),
                    ));
                }
            }
            Aux::Unspecified => {
                // Only reachable at the top level of a definition; unused
                // role parameters are reported but allowed.
                for role in &node.env.roles {
                    if !primary.contains(role) && !computed.contains(role) {
                        self.ctx.warn(Warning::UnusedRoleParam {
                            name: name.unwrap_or("anonymous chor").to_string(),
                            role: role.clone(),
                        });
                    }
                }
            }
        }
        let rtype = Type::Chor {
            params: sig_params.clone(),
            ret: ret.clone(),
            aux: Aux::Roles(computed),
        }
        .normalize();
        let mentions = rtype.roles_of();
        Ok((rtype, mentions))
    }

    fn check_invoke(
        &mut self,
        node: &Node,
        op: &mut Node,
        args: &mut [Node],
    ) -> Result<(Type, RoleSet), TypeError> {
        self.check_node(op)?;
        for arg in args.iter_mut() {
            self.check_node(arg)?;
        }
        let mut mentions = op.rmentions.clone();
        for arg in args.iter() {
            mentions.extend(arg.rmentions.iter().cloned());
        }
        let op_type = op.rtype.clone().expect("checked above");
        match op_type {
            Type::Agree { roles } => {
                for arg in args.iter() {
                    let arg_roles = self.agree_roles(arg, "argument")?;
                    if !roles.iter().all(|r| arg_roles.contains(r)) {
                        return Err(err(
                            arg,
                            format!(
                                "argument agreement {} does not cover the operator's {}",
                                Type::Agree { roles: arg_roles.clone() }.rendered(),
                                Type::Agree { roles: roles.clone() }.rendered()
                            ),
                        ));
                    }
                }
                let rtype = Type::Agree { roles };
                mentions.extend(rtype.roles_of());
                Ok((rtype, mentions))
            }
            Type::Chor { params, ret, .. } => {
                if params.len() != args.len() {
                    return Err(err(
                        node,
                        format!("choreography takes {} arguments, {} given", params.len(), args.len()),
                    ));
                }
                for (arg, expected) in args.iter().zip(&params) {
                    let found = normalized(arg);
                    if found != expected.clone().normalize() {
                        return Err(err(
                            arg,
                            format!("argument is {}, expected {}", found.rendered(), expected.rendered()),
                        ));
                    }
                }
                let rtype = (*ret).normalize();
                mentions.extend(rtype.roles_of());
                Ok((rtype, mentions))
            }
            other => Err(err(
                node,
                format!("cannot invoke a value of type {}", other.rendered()),
            )),
        }
    }
}

fn normalized(node: &Node) -> Type {
    node.rtype.clone().expect("node checked before use").normalize()
}

fn union(mut base: RoleSet, extra: &RoleSet) -> RoleSet {
    base.extend(extra.iter().cloned());
    base
}

/// Post-checking assertions: every node has a round-trippable type, a
/// non-empty mention set, and a mask; every recorded binding has a type.
pub fn sanity_check(root: &Node) -> Result<(), TypeError> {
    let mut result = Ok(());
    root.postorder(&mut |node| {
        if result.is_err() {
            return;
        }
        let Some(rtype) = node.rtype.as_ref() else {
            result = Err(err(node, "internal: node left untyped after checking"));
            return;
        };
        match parse_type(&rtype.render()) {
            Ok(back) if back == *rtype => {}
            _ => {
                result = Err(err(node, "internal: type does not round-trip through its rendering"));
                return;
            }
        }
        if node.rmentions.is_empty() {
            result = Err(err(node, "internal: node mentions no role"));
            return;
        }
        if node.env.mask.is_empty() {
            result = Err(err(node, "internal: node has an empty mask"));
            return;
        }
        for binding in node.env.locals.values() {
            if binding.rtype.is_none() {
                result = Err(err(node, format!("internal: binding {} left untyped", binding.sym)));
                return;
            }
        }
    });
    result
}
