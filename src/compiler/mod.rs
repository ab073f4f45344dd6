//! Compilation pipeline for choreographic definitions
//!
//! Surface form → parse → role validation → type checking → optional
//! dynamic-check instrumentation (and re-check) → per-role endpoint
//! projection → cleanup. Compile-time failures roll the definition's
//! registry entry back completely.

pub mod checker;
pub mod emitter;
pub mod instrument;
pub mod parser;
pub mod projection;
pub mod registry;

use std::sync::Arc;

use thiserror::Error;

use crate::ast::env::Env;
use crate::ast::node::{Node, NodeKind};
use crate::ast::role::{Role, RoleSet};
use crate::ast::types::{parse_type, Aux, Type};
use crate::ast::validation::{validate_roles, RoleError};
use crate::config::InstrumentationError;
use crate::form::{Form, ReadError};

pub use checker::{check, sanity_check, TypeError};
pub use emitter::cleanup;
pub use parser::{ParseError, Parser};
pub use projection::{is_noop, noop_form, project, ProjectionError};
pub use registry::{alpha_equivalent, Context, Definition, DefinitionError, Warning};

/// Any compile-time failure; each variant carries the offending form.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),
}

fn parse_err(form: &Form, reason: impl Into<String>) -> CompileError {
    CompileError::Parse(ParseError { reason: reason.into(), form: form.clone(), span: form.span })
}

/// Compile a `(defchor Name [Role+] Signature [Param*] Expr*)` form.
/// With no parameter vector and body, this is a forward declaration.
pub fn defchor(ctx: &Context, form: &Form) -> Result<Arc<Definition>, CompileError> {
    let Some(items) = form.as_list() else {
        return Err(parse_err(form, "defchor must be a list form"));
    };
    match items.first().and_then(Form::as_sym) {
        Some("defchor") => {}
        _ => return Err(parse_err(form, "expected a defchor form")),
    }
    let Some(name) = items.get(1).and_then(Form::as_sym) else {
        return Err(parse_err(form, "defchor needs a name symbol"));
    };
    let Some(roles_form) = items.get(2) else {
        return Err(parse_err(form, "defchor needs a role parameter vector"));
    };
    let roles = parser::parse_role_vector(roles_form).map_err(CompileError::Parse)?;
    for (i, role) in roles.iter().enumerate() {
        if roles[..i].contains(role) {
            return Err(parse_err(roles_form, format!("duplicate role parameter {role}")));
        }
    }
    let Some(sig_form) = items.get(3) else {
        return Err(parse_err(form, "defchor needs a signature"));
    };
    let sig = parse_type(sig_form).map_err(|e| parse_err(sig_form, e.reason))?;
    let Type::Chor { .. } = sig else {
        return Err(parse_err(sig_form, "defchor signature must be a choreography type"));
    };
    let sig = parser::adjust_signature(sig);
    let declared = declared_signature(&sig, &roles);

    let rest = &items[4..];
    if rest.is_empty() {
        // Forward declaration: only the signature is installed.
        let def = Definition {
            name: name.to_string(),
            roles,
            signature: declared,
            projections: None,
        };
        let guard = ctx.install(def.clone())?;
        guard.commit(def.clone());
        return Ok(Arc::new(def));
    }

    let declared_def = Definition {
        name: name.to_string(),
        roles: roles.clone(),
        signature: declared,
        projections: None,
    };
    let guard = ctx.install(declared_def)?;

    // Parse the body as a chor under the definition's role scope, then
    // re-tag it as the top-level chor of this definition (self reference
    // goes through the registry, not a local binding).
    let mut chor_items = vec![Form::sym("chor"), sig_form.clone()];
    chor_items.extend(rest.iter().cloned());
    let chor_form = Form::list(chor_items).with_span(form.span);
    let env = Env::top(roles.clone());
    let mut node = Parser::new(ctx).parse(&chor_form, &env)?;
    if let NodeKind::Chor { name: chor_name, top_level, .. } = &mut node.kind {
        *chor_name = Some(name.to_string());
        *top_level = true;
    }

    missing_aux_walk(&node)?;
    validate_roles(&node)?;
    check(ctx, &mut node)?;
    sanity_check(&node)?;

    if instrument::instrument(ctx, &mut node)? {
        check(ctx, &mut node)?;
        sanity_check(&node)?;
    }

    let signature = match node.rtype.clone() {
        Some(t @ Type::Chor { .. }) => t,
        _ => return Err(parse_err(form, "internal: definition did not check to a choreography type")),
    };

    ctx.freeze();
    let projections = roles
        .iter()
        .map(|role| project(ctx, &roles, &node, role).map(cleanup))
        .collect::<Result<Vec<_>, _>>();
    ctx.thaw();
    let projections = projections?;

    let def = Definition {
        name: name.to_string(),
        roles,
        signature,
        projections: Some(projections),
    };
    guard.commit(def.clone());
    tracing::debug!(name, "compiled choreography");
    Ok(Arc::new(def))
}

/// The signature as installed before the body is analyzed: a top-level aux
/// left unspecified defaults to all role parameters minus the primary
/// roles.
fn declared_signature(sig: &Type, roles: &[Role]) -> Type {
    let Type::Chor { params, ret, aux } = sig else {
        return sig.clone();
    };
    let aux = match aux {
        Aux::Roles(_) => aux.clone(),
        Aux::Unspecified => {
            let primary = sig.primary_roles();
            let defaulted: RoleSet =
                roles.iter().filter(|r| !primary.contains(*r)).cloned().collect();
            Aux::Roles(defaulted)
        }
    };
    Type::Chor { params: params.clone(), ret: ret.clone(), aux }.normalize()
}

/// A named chor in expression position must state its aux set explicitly.
fn missing_aux_walk(root: &Node) -> Result<(), DefinitionError> {
    let mut result = Ok(());
    root.postorder(&mut |node| {
        if result.is_err() {
            return;
        }
        if let NodeKind::Chor { name: Some(name), sig, top_level: false, .. } = &node.kind {
            if let Type::Chor { aux: Aux::Unspecified, .. } = sig {
                result = Err(DefinitionError::MissingAux { name: name.clone() });
            }
        }
    });
    result
}

/// Compile every top-level form in `src`: `defchor`, `with-opts`, and
/// `alter-opts!` forms are recognized.
pub fn compile_str(ctx: &Context, src: &str) -> Result<Vec<Arc<Definition>>, CompileError> {
    let forms = crate::form::read_str(src)?;
    let mut defs = Vec::new();
    for form in &forms {
        compile_form(ctx, form, &mut defs)?;
    }
    Ok(defs)
}

/// Compile every top-level form in a source file.
pub fn compile_file(
    ctx: &Context,
    path: &std::path::Path,
) -> Result<Vec<Arc<Definition>>, CompileError> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| ReadError { reason: e.to_string(), line: 0, col: 0 })?;
    compile_str(ctx, &src)
}

fn compile_form(
    ctx: &Context,
    form: &Form,
    defs: &mut Vec<Arc<Definition>>,
) -> Result<(), CompileError> {
    match form.op_sym() {
        Some("defchor") => {
            defs.push(defchor(ctx, form)?);
            Ok(())
        }
        Some("with-opts") => {
            let items = form.as_list().expect("op_sym implies a list");
            let Some(opts_form) = items.get(1) else {
                return Err(parse_err(form, "with-opts needs a configuration map"));
            };
            let inner = ctx.with_opts(opts_form, |ctx| {
                let mut out = Ok(());
                for body_form in &items[2..] {
                    out = compile_form(ctx, body_form, defs);
                    if out.is_err() {
                        break;
                    }
                }
                out
            })?;
            inner
        }
        Some("alter-opts!") => {
            let items = form.as_list().expect("op_sym implies a list");
            let Some(opts_form) = items.get(1) else {
                return Err(parse_err(form, "alter-opts! needs a configuration map"));
            };
            ctx.alter_opts(opts_form)?;
            Ok(())
        }
        _ => Err(parse_err(form, "expected defchor, with-opts, or alter-opts!")),
    }
}
