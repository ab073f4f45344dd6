//! Runtime library consumed by projected code
//!
//! Projected programs are host forms referring to a small vocabulary: the
//! `noop` sentinel, `send!`/`recv!` against peer locators, and `make-proj`
//! for instantiations. The evaluator in [`interp`] runs them against a
//! [`Transport`](transport::Transport); [`simulate`](simulate::simulate)
//! wires every role of a definition onto an in-memory network.

pub mod interp;
pub mod simulate;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::ast::role::Role;
use crate::ast::types::Type;
use crate::compiler::registry::{Context, Definition};
use crate::form::{Form, FormKind};
use interp::{Scope, Vm};
use transport::Transport;

pub use interp::apply_chor;
pub use simulate::{simulate, Simulation};
pub use transport::{in_memory_network, CommEvent, InMemoryTransport, Recording, TcpTransport};

/// A dynamically typed runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// "No result at this role."
    Noop,
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Keyword(String),
    Vector(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// A host closure.
    Fn(HostFn),
    /// A projected choreography, closed over its locator mapping.
    Chor(ChorClosure),
    /// A named runtime builtin.
    Builtin(&'static str),
}

#[derive(Clone)]
pub struct HostFn {
    pub name: Option<String>,
    /// Parameter patterns: symbols or nested vector binders.
    pub params: Vec<Form>,
    pub body: Arc<Vec<Form>>,
    pub scope: Arc<Scope>,
    /// The locator mapping in force where the function was created; its
    /// body's communication actions are indexed in that space.
    pub map: Vec<usize>,
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#fn[{}]", self.name.as_deref().unwrap_or("anonymous"))
    }
}

/// A choreography value: which definition, which role position, and the
/// locator each of the definition's role positions maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChorClosure {
    pub name: String,
    pub pos: usize,
    pub map: Vec<usize>,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Noop, Value::Noop) | (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Sym(a), Value::Sym(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Chor(a), Value::Chor(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Noop => write!(f, "noop"),
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Sym(s) => write!(f, "{s}"),
            Value::Keyword(k) => write!(f, ":{k}"),
            Value::Vector(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{k} {v}")?;
                }
                write!(f, "}}")
            }
            Value::Set(items) => {
                write!(f, "#{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::Fn(func) => write!(f, "{func:?}"),
            Value::Chor(c) => write!(f, "#chor[{}@{}]", c.name, c.pos),
            Value::Builtin(name) => write!(f, "#builtin[{name}]"),
        }
    }
}

impl Value {
    /// Convert a literal form into a value; `None` for non-literals.
    pub fn from_literal(form: &Form) -> Option<Value> {
        match &form.kind {
            FormKind::Nil => Some(Value::Nil),
            FormKind::Bool(b) => Some(Value::Bool(*b)),
            FormKind::Int(n) => Some(Value::Int(*n)),
            FormKind::Str(s) => Some(Value::Str(s.clone())),
            FormKind::Keyword(k) => Some(Value::Keyword(k.clone())),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

/// Raised by projected code or a transport.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("agreement mismatch for {param}: observed {observed:?} (in {context})")]
    AgreementMismatch { param: String, observed: Vec<Value>, context: String },

    #[error("signature of {name} changed since compile time: expected {expected}, found {found}; recompile the caller")]
    SignatureChanged { name: String, expected: String, found: String },

    #[error("unknown choreography {0}")]
    UnknownChor(String),

    #[error("{0} is undefined")]
    Undefined(String),

    #[error("uncaught throw: {0}")]
    Thrown(Value),

    #[error("value {0} cannot be called")]
    NotCallable(Value),

    #[error("{0}")]
    BadArgument(String),
}

/// Per-role runtime configuration: the role being played and its transport.
pub struct RoleConfig<T> {
    pub role: Role,
    pub transport: T,
}

/// Invoke the projection of `def` for `config.role`.
///
/// The argument list is derived by erasure: parameters whose type does not
/// mention the role are omitted; agreement-typed parameters are passed
/// as-is; tuple- and choreography-typed parameters cannot be supplied from
/// the host and must be wrapped in a choreography instead.
pub async fn play_role<T: Transport>(
    ctx: &Context,
    config: &mut RoleConfig<T>,
    def: &Definition,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    let Some(pos) = def.role_index(&config.role) else {
        return Err(RuntimeError::BadArgument(format!(
            "{} is not a role of {}",
            config.role, def.name
        )));
    };
    let Some(projections) = def.projections.as_ref() else {
        return Err(RuntimeError::BadArgument(format!(
            "{} is only forward-declared and has no body",
            def.name
        )));
    };
    let expected = erased_arity(&def.signature, &config.role, &def.name)?;
    if args.len() != expected {
        return Err(RuntimeError::BadArgument(format!(
            "{} expects {} arguments at {}, {} given",
            def.name,
            expected,
            config.role,
            args.len()
        )));
    }

    let projection = &projections[pos];
    if crate::compiler::is_noop(projection) {
        return Ok(Value::Noop);
    }
    tracing::debug!(name = %def.name, role = %config.role, "playing role");

    let mut vm = Vm::new(ctx, &mut config.transport, (0..def.roles.len()).collect());
    let scope = Scope::root();
    let callee = vm.eval_value(&scope, projection).await?;
    let result = vm.apply(callee, args).await?;
    Ok(erase_return(&def.signature, &config.role, result))
}

/// Number of parameters that survive erasure for `role`; rejects
/// host-supplied tuple and choreography parameters.
fn erased_arity(signature: &Type, role: &Role, name: &str) -> Result<usize, RuntimeError> {
    let Type::Chor { params, .. } = signature else {
        return Ok(0);
    };
    let mut count = 0;
    for param in params {
        if !param.roles_of().contains(role) {
            continue;
        }
        if !param.is_agree() {
            return Err(RuntimeError::BadArgument(format!(
                "parameter of type {} cannot be passed into {} from the host; wrap it in a choreography",
                param.rendered(),
                name
            )));
        }
        count += 1;
    }
    Ok(count)
}

/// Return-value erasure: tuple positions that do not mention the role are
/// already omitted by projection; a single surviving position is unwrapped.
fn erase_return(signature: &Type, role: &Role, result: Value) -> Value {
    let Type::Chor { ret, .. } = signature else {
        return result;
    };
    if let Type::Tuple { elems } = ret.as_ref() {
        let surviving = elems.iter().filter(|t| t.roles_of().contains(role)).count();
        if surviving == 1 {
            if let Value::Vector(mut items) = result {
                if items.len() == 1 {
                    return items.pop().expect("length checked above");
                }
                return Value::Vector(items);
            }
        }
    }
    result
}
