//! Choreographic programming for S-expression choreographies
//!
//! A choreography describes the joint behavior of several roles in one
//! program; this crate type-checks choreographies under a three-kind
//! choreographic type system (agreement, tuple, choreography) and splits
//! them by endpoint projection into one executable program per role, so
//! that running all projections concurrently realizes the global behavior.
//!
//! The pipeline behind [`compiler::defchor`]: parse → role validation →
//! type checking → optional dynamic-check instrumentation → per-role
//! projection → cleanup. The [`runtime`] module executes projected programs
//! against a transport and can simulate every role in process.

pub mod ast;
pub mod compiler;
pub mod config;
pub mod form;
pub mod runtime;

// Re-export main APIs
pub use ast::{Aux, Role, RoleSet, Type};
pub use compiler::{compile_file, compile_str, defchor, CompileError, Context, Definition, Warning};
pub use config::{AgreementVerify, Options, SignatureVerify};
pub use form::{read_one, read_str, Form, FormKind};
pub use runtime::{
    apply_chor, in_memory_network, play_role, simulate, CommEvent, InMemoryTransport, Recording,
    RoleConfig, RuntimeError, Simulation, TcpTransport, Value,
};
