// Dynamic-check instrumentation
//
// An optional AST-rewriting pass driven by the active configuration. Two
// independent checks: agreement verification for agreement-typed parameters
// of a top-level chor, and signature verification at every instantiation
// site. Synthesized code is ordinary surface syntax parsed back through the
// parser; the caller re-checks the whole tree afterwards, since the
// instrumentation may widen the mention sets.

use crate::ast::env::{Binder, Binding};
use crate::ast::node::{Node, NodeKind};
use crate::ast::role::{Role, RoleSet};
use crate::ast::types::Type;
use crate::compiler::parser::{ParseError, Parser};
use crate::compiler::registry::Context;
use crate::config::{AgreementVerify, SignatureVerify};
use crate::form::Form;

/// Rewrite the top-level chor `node` according to the active options.
/// Returns true when anything changed and a re-check is needed.
pub fn instrument(ctx: &Context, node: &mut Node) -> Result<bool, ParseError> {
    let opts = ctx.opts();
    let mut changed = false;
    if opts.verify_signature != SignatureVerify::Off {
        mark_inst_sites(node, &mut changed);
    }
    if opts.verify_agreement != AgreementVerify::Off {
        changed |= wrap_agree_nodes(ctx, node, &opts.verify_agreement)?;
        changed |= insert_agreement_checks(ctx, node, &opts.verify_agreement)?;
    }
    Ok(changed)
}

/// Wrap every `agree!` whose result spans several roles in a uniformity
/// check, so a dynamic disagreement raises the same error at every holder.
fn wrap_agree_nodes(
    ctx: &Context,
    node: &mut Node,
    mode: &AgreementVerify,
) -> Result<bool, ParseError> {
    let mut changed = false;
    for child in node.children_mut() {
        changed |= wrap_agree_nodes(ctx, child, mode)?;
    }
    let is_target = matches!(&node.kind, NodeKind::Agree { .. })
        && matches!(node.rtype.as_ref(), Some(Type::Agree { roles }) if roles.len() >= 2);
    if !is_target {
        return Ok(changed);
    }
    let Some(Type::Agree { roles }) = node.rtype.clone() else {
        return Ok(changed);
    };
    let binding = Binding::new("%agreed");
    let mut check_env = node.env.non_tail();
    check_env.bind(binding.clone());
    let check_form = match mode {
        AgreementVerify::Decentralized => decentralized_check(&binding.sym, &roles),
        AgreementVerify::Centralized(center) => {
            let center = if roles.contains(center) {
                center.clone()
            } else {
                roles.iter().next().expect("agreement sets are never empty").clone()
            };
            centralized_check(&binding.sym, &roles, &center)
        }
        AgreementVerify::Off => return Ok(changed),
    };
    let check = Parser::new(ctx).parse(&check_form, &check_env)?;
    let env = node.env.clone();
    let form = node.form.clone();
    let original = std::mem::replace(
        node,
        Node::new(NodeKind::Const { form: Form::nil() }, env.clone(), form.clone()),
    );
    *node = Node::new(
        NodeKind::Let { bindings: vec![(binding, original)], body: vec![check] },
        env,
        form,
    );
    Ok(true)
}

fn mark_inst_sites(node: &mut Node, changed: &mut bool) {
    if let NodeKind::Inst { check_sig, .. } = &mut node.kind {
        if !*check_sig {
            *check_sig = true;
            *changed = true;
        }
    }
    for child in node.children_mut() {
        mark_inst_sites(child, changed);
    }
}

fn insert_agreement_checks(
    ctx: &Context,
    node: &mut Node,
    mode: &AgreementVerify,
) -> Result<bool, ParseError> {
    let NodeKind::Chor { sig, params, body, .. } = &mut node.kind else {
        return Ok(false);
    };
    let Type::Chor { params: sig_params, .. } = sig else {
        return Ok(false);
    };
    let Some(body_env) = body.first().map(|n| n.env.non_tail()) else {
        return Ok(false);
    };
    let parser = Parser::new(ctx);
    let mut checks = Vec::new();
    for (binder, ptype) in params.iter().zip(sig_params.iter()) {
        let Binder::Sym { sym, .. } = binder else {
            continue;
        };
        let Type::Agree { roles } = ptype else {
            continue;
        };
        if roles.len() < 2 {
            continue;
        }
        let form = match mode {
            AgreementVerify::Decentralized => decentralized_check(sym, roles),
            AgreementVerify::Centralized(center) => {
                let center = if roles.contains(center) {
                    center.clone()
                } else {
                    roles.iter().next().expect("agreement sets are never empty").clone()
                };
                centralized_check(sym, roles, &center)
            }
            AgreementVerify::Off => continue,
        };
        checks.push(parser.parse(&form, &body_env)?);
    }
    if checks.is_empty() {
        return Ok(false);
    }
    checks.append(body);
    *body = checks;
    Ok(true)
}

fn sym_of(role: &Role) -> Form {
    Form::sym(role.name())
}

fn quoted(name: &str) -> Form {
    Form::list(vec![Form::sym("quote"), Form::sym(name)])
}

/// One copy of `param`, narrowed to `holder` and shipped to `observer`.
fn shipped_copy(param: &str, holder: &Role, observer: &Role) -> Form {
    let local = Form::list(vec![
        Form::sym("narrow"),
        Form::vector(vec![sym_of(holder)]),
        Form::sym(param),
    ]);
    if holder == observer {
        return local;
    }
    Form::list(vec![
        Form::sym("narrow"),
        Form::vector(vec![sym_of(observer)]),
        Form::list(vec![
            Form::sym("copy"),
            Form::vector(vec![sym_of(holder), sym_of(observer)]),
            local,
        ]),
    ])
}

fn raise_form(param: &str, observed: Form) -> Form {
    Form::list(vec![Form::sym("agreement-error"), quoted(param), observed, Form::string(param)])
}

/// All copies travel to `center`, which compares and answers with the
/// verdict and the observed vector; every role raises on mismatch.
fn centralized_check(param: &str, roles: &RoleSet, center: &Role) -> Form {
    let copies: Vec<Form> = roles.iter().map(|r| shipped_copy(param, r, center)).collect();
    let gathered = Form::list(vec![
        Form::sym("lifting"),
        Form::vector(vec![sym_of(center)]),
        Form::list(vec![
            Form::sym("let"),
            Form::vector(vec![Form::sym("obs"), Form::vector(copies)]),
            Form::vector(vec![
                Form::list(vec![Form::sym("uniform?"), Form::sym("obs")]),
                Form::sym("obs"),
            ]),
        ]),
    ]);
    let mut answered = gathered;
    for role in roles.iter().filter(|r| *r != center) {
        answered = Form::list(vec![
            Form::sym("copy"),
            Form::vector(vec![sym_of(center), sym_of(role)]),
            answered,
        ]);
    }
    let verdict = Form::list(vec![Form::sym("nth"), Form::sym("verdict"), Form::int(0)]);
    let observed = Form::list(vec![Form::sym("nth"), Form::sym("verdict"), Form::int(1)]);
    Form::list(vec![
        Form::sym("lifting"),
        Form::vector(roles.iter().map(sym_of).collect()),
        Form::list(vec![
            Form::sym("let"),
            Form::vector(vec![Form::sym("verdict"), answered]),
            Form::list(vec![
                Form::sym("if"),
                verdict,
                Form::sym(param),
                raise_form(param, observed),
            ]),
        ]),
    ])
}

/// Pairwise broadcast; every role gathers all copies and compares locally.
/// The gathered rows agree by construction, so `agree!` stitches them into
/// one observation known at every role.
fn decentralized_check(param: &str, roles: &RoleSet) -> Form {
    let rows: Vec<Form> = roles
        .iter()
        .map(|observer| {
            let copies: Vec<Form> =
                roles.iter().map(|holder| shipped_copy(param, holder, observer)).collect();
            Form::list(vec![sym_of(observer), Form::vector(copies)])
        })
        .collect();
    let mut agree = vec![Form::sym("agree!")];
    agree.extend(rows);
    Form::list(vec![
        Form::sym("lifting"),
        Form::vector(roles.iter().map(sym_of).collect()),
        Form::list(vec![
            Form::sym("let"),
            Form::vector(vec![Form::sym("obs"), Form::list(agree)]),
            Form::list(vec![
                Form::sym("if"),
                Form::list(vec![Form::sym("uniform?"), Form::sym("obs")]),
                Form::sym(param),
                raise_form(param, Form::sym("obs")),
            ]),
        ]),
    ])
}
