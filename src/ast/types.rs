// Choreographic type representation
//
// Three constructors: agreement, tuple, choreography. Types are parsed from
// surface forms, rendered back, and compared structurally after
// normalization.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::role::{Role, RoleSet};
use crate::form::{Form, FormKind};

/// The auxiliary role set of a choreography type. `Unspecified` only occurs
/// transiently in user input; the checker resolves it to a concrete set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aux {
    Unspecified,
    Roles(RoleSet),
}

impl Aux {
    pub fn roles(&self) -> Option<&RoleSet> {
        match self {
            Aux::Unspecified => None,
            Aux::Roles(rs) => Some(rs),
        }
    }
}

/// A choreographic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// The value is present, equal, at every listed role. Never empty.
    Agree { roles: RoleSet },
    /// Positional product of heterogeneous sub-types. Never empty.
    Tuple { elems: Vec<Type> },
    /// A first-class choreography.
    Chor { params: Vec<Type>, ret: Box<Type>, aux: Aux },
}

/// Malformed type shape.
#[derive(Debug, Error)]
#[error("bad type {form}: {reason}")]
pub struct BadType {
    pub reason: String,
    pub form: Form,
}

fn bad(form: &Form, reason: impl Into<String>) -> BadType {
    BadType { reason: reason.into(), form: form.clone() }
}

impl Type {
    pub fn agree(roles: RoleSet) -> Self {
        Type::Agree { roles }
    }

    pub fn agree_one(role: impl Into<Role>) -> Self {
        let mut roles = RoleSet::new();
        roles.insert(role.into());
        Type::Agree { roles }
    }

    pub fn is_agree(&self) -> bool {
        matches!(self, Type::Agree { .. })
    }

    pub fn agree_roles(&self) -> Option<&RoleSet> {
        match self {
            Type::Agree { roles } => Some(roles),
            _ => None,
        }
    }

    /// All roles transitively contained in the type, including aux sets.
    pub fn roles_of(&self) -> RoleSet {
        let mut out = RoleSet::new();
        self.collect_roles(&mut out);
        out
    }

    fn collect_roles(&self, out: &mut RoleSet) {
        match self {
            Type::Agree { roles } => out.extend(roles.iter().cloned()),
            Type::Tuple { elems } => {
                for elem in elems {
                    elem.collect_roles(out);
                }
            }
            Type::Chor { params, ret, aux } => {
                for param in params {
                    param.collect_roles(out);
                }
                ret.collect_roles(out);
                if let Aux::Roles(roles) = aux {
                    out.extend(roles.iter().cloned());
                }
            }
        }
    }

    /// Primary roles of a choreography type: everything in params and ret.
    pub fn primary_roles(&self) -> RoleSet {
        match self {
            Type::Chor { params, ret, .. } => {
                let mut out = RoleSet::new();
                for param in params {
                    param.collect_roles(&mut out);
                }
                ret.collect_roles(&mut out);
                out
            }
            other => other.roles_of(),
        }
    }

    /// Apply `f` to every type in the tree, children first.
    pub fn postwalk(self, f: &mut impl FnMut(Type) -> Type) -> Type {
        let walked = match self {
            Type::Agree { roles } => Type::Agree { roles },
            Type::Tuple { elems } => {
                Type::Tuple { elems: elems.into_iter().map(|t| t.postwalk(f)).collect() }
            }
            Type::Chor { params, ret, aux } => Type::Chor {
                params: params.into_iter().map(|t| t.postwalk(f)).collect(),
                ret: Box::new(ret.postwalk(f)),
                aux,
            },
        };
        f(walked)
    }

    /// Subtract every nested choreography's primary roles from its aux set.
    /// Idempotent.
    pub fn normalize(self) -> Type {
        self.postwalk(&mut |t| match t {
            Type::Chor { params, ret, aux } => {
                let aux = match aux {
                    Aux::Unspecified => Aux::Unspecified,
                    Aux::Roles(roles) => {
                        let mut primary = RoleSet::new();
                        for param in &params {
                            param.collect_roles(&mut primary);
                        }
                        ret.collect_roles(&mut primary);
                        Aux::Roles(roles.difference(&primary).cloned().collect())
                    }
                };
                Type::Chor { params, ret, aux }
            }
            other => other,
        })
    }

    /// Replace every role in the type using `subst`; roles absent from the
    /// map are fixed points.
    pub fn substitute(self, subst: &HashMap<Role, Role>) -> Type {
        let sub_set = |roles: &RoleSet| -> RoleSet {
            roles.iter().map(|r| subst.get(r).unwrap_or(r).clone()).collect()
        };
        self.postwalk(&mut |t| match t {
            Type::Agree { roles } => Type::Agree { roles: sub_set(&roles) },
            Type::Chor { params, ret, aux } => {
                let aux = match aux {
                    Aux::Unspecified => Aux::Unspecified,
                    Aux::Roles(roles) => Aux::Roles(sub_set(&roles)),
                };
                Type::Chor { params, ret, aux }
            }
            other => other,
        })
    }

    /// Render back to a surface form; the inverse of [`parse_type`].
    pub fn render(&self) -> Form {
        match self {
            Type::Agree { roles } => {
                if roles.len() == 1 {
                    Form::sym(roles.iter().next().map(Role::name).unwrap_or_default())
                } else {
                    Form::set(roles.iter().map(|r| Form::sym(r.name())).collect())
                }
            }
            Type::Tuple { elems } => Form::vector(elems.iter().map(Type::render).collect()),
            Type::Chor { params, ret, aux } => {
                let mut items = vec![Form::sym("->")];
                items.extend(params.iter().map(Type::render));
                items.push(ret.render());
                match aux {
                    Aux::Unspecified => {}
                    Aux::Roles(roles) if roles.is_empty() => {
                        items.push(Form::sym("|"));
                        items.push(Form::int(0));
                    }
                    Aux::Roles(roles) => {
                        items.push(Form::sym("|"));
                        items.extend(roles.iter().map(|r| Form::sym(r.name())));
                    }
                }
                Form::list(items)
            }
        }
    }

    /// Rendered string, for messages and signature comparison.
    pub fn rendered(&self) -> String {
        self.render().to_string()
    }
}

/// Parse a surface representation into a [`Type`].
pub fn parse_type(form: &Form) -> Result<Type, BadType> {
    match &form.kind {
        FormKind::Sym(name) => {
            if name == "->" || name == "|" {
                return Err(bad(form, "expected a role name"));
            }
            Ok(Type::agree_one(name.as_str()))
        }
        FormKind::Set(items) => {
            if items.is_empty() {
                return Err(bad(form, "agreement set cannot be empty"));
            }
            let mut roles = RoleSet::new();
            for item in items {
                let name = item.as_sym().ok_or_else(|| bad(item, "agreement set element must be a role"))?;
                if !roles.insert(Role::new(name)) {
                    return Err(bad(form, format!("duplicate role {name}")));
                }
            }
            Ok(Type::Agree { roles })
        }
        FormKind::Vector(items) => {
            if items.is_empty() {
                return Err(bad(form, "tuple type cannot be empty"));
            }
            let elems = items.iter().map(parse_type).collect::<Result<Vec<_>, _>>()?;
            Ok(Type::Tuple { elems })
        }
        FormKind::List(items) => parse_chor_type(form, items),
        _ => Err(bad(form, "expected a type")),
    }
}

fn parse_chor_type(form: &Form, items: &[Form]) -> Result<Type, BadType> {
    match items.first() {
        Some(head) if head.is_sym("->") => {}
        _ => return Err(bad(form, "choreography type must start with ->")),
    }
    let rest = &items[1..];
    let bar = rest.iter().position(|f| f.is_sym("|"));
    let (types, aux_spec) = match bar {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };
    if types.is_empty() {
        return Err(bad(form, "choreography type is missing a return type"));
    }
    let mut parsed = types.iter().map(parse_type).collect::<Result<Vec<_>, _>>()?;
    let ret = parsed.pop().expect("types checked non-empty above");
    let aux = match aux_spec {
        None => Aux::Unspecified,
        Some(spec) => parse_aux(form, spec)?,
    };
    Ok(Type::Chor { params: parsed, ret: Box::new(ret), aux })
}

fn parse_aux(form: &Form, spec: &[Form]) -> Result<Aux, BadType> {
    if spec.is_empty() {
        return Err(bad(form, "aux specification after | cannot be empty"));
    }
    let zeros = spec.iter().filter(|f| f.as_int() == Some(0)).count();
    if zeros > 0 {
        if spec.len() > 1 {
            return Err(bad(form, "aux cannot mix 0 with roles"));
        }
        return Ok(Aux::Roles(RoleSet::new()));
    }
    let mut roles = RoleSet::new();
    for item in spec {
        let name = item.as_sym().ok_or_else(|| bad(item, "aux element must be a role or 0"))?;
        if !roles.insert(Role::new(name)) {
            return Err(bad(form, format!("duplicate aux role {name}")));
        }
    }
    Ok(Aux::Roles(roles))
}
