// Role validation
//
// A post-order walk over the AST checking every operator that carries
// explicit role references against the surrounding role scope.

use thiserror::Error;

use crate::ast::node::{Node, NodeKind};
use crate::ast::role::{scope_string, Role};
use crate::form::{Form, Span};

/// A role reference that is out of scope, duplicated, or malformed.
#[derive(Debug, Error)]
#[error("role error in {form}: {reason}")]
pub struct RoleError {
    pub reason: String,
    pub form: Form,
    pub span: Option<Span>,
}

fn err(node: &Node, reason: impl Into<String>) -> RoleError {
    RoleError { reason: reason.into(), form: node.form.clone(), span: node.span() }
}

/// Validate every role reference in the tree.
pub fn validate_roles(root: &Node) -> Result<(), RoleError> {
    let mut result = Ok(());
    root.postorder(&mut |node| {
        if result.is_ok() {
            result = validate_node(node);
        }
    });
    result
}

fn validate_node(node: &Node) -> Result<(), RoleError> {
    match &node.kind {
        NodeKind::Narrow { roles, .. } | NodeKind::Lifting { roles, .. } => {
            check_listed(node, roles)
        }
        NodeKind::Copy { src, dst, .. } => {
            check_listed(node, &[src.clone(), dst.clone()])?;
            if src == dst {
                return Err(err(node, format!("copy source and destination are both {src}")));
            }
            Ok(())
        }
        NodeKind::Inst { roles, .. } => check_listed(node, roles),
        NodeKind::Chor { sig, .. } => {
            for role in sig.roles_of() {
                if !node.env.is_role(role.name()) {
                    return Err(err(
                        node,
                        format!("signature role {role} is not in scope {}", scope_string(&node.env.roles)),
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_listed(node: &Node, roles: &[Role]) -> Result<(), RoleError> {
    for (i, role) in roles.iter().enumerate() {
        if !node.env.is_role(role.name()) {
            return Err(err(
                node,
                format!("role {role} is not in scope {}", scope_string(&node.env.roles)),
            ));
        }
        if roles[..i].contains(role) {
            return Err(err(node, format!("role {role} is listed more than once")));
        }
    }
    Ok(())
}
