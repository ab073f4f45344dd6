// Compiler configuration
//
// A nested configuration map governs dynamic-check instrumentation. The
// typed form lives here; `with_opts`/`alter_opts` scoping is on `Context`.

use thiserror::Error;

use crate::ast::role::Role;
use crate::form::{Form, FormKind};

/// Run-time agreement verification for agreement-typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AgreementVerify {
    #[default]
    Off,
    /// Pairwise broadcast; every role compares locally.
    Decentralized,
    /// Copies travel to the named role, which compares and answers.
    Centralized(Role),
}

/// Run-time signature verification at instantiation sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureVerify {
    #[default]
    Off,
    /// Report drift but keep running.
    Warn,
    /// Refuse to run against a changed signature.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Options {
    pub verify_agreement: AgreementVerify,
    pub verify_signature: SignatureVerify,
}

/// Unknown or ill-typed configuration option.
#[derive(Debug, Error)]
#[error("bad configuration {form}: {reason}")]
pub struct InstrumentationError {
    pub reason: String,
    pub form: Form,
}

fn bad(form: &Form, reason: impl Into<String>) -> InstrumentationError {
    InstrumentationError { reason: reason.into(), form: form.clone() }
}

impl Options {
    /// Apply a (possibly partial) configuration map on top of `self`.
    pub fn updated(&self, form: &Form) -> Result<Options, InstrumentationError> {
        let FormKind::Map(pairs) = &form.kind else {
            return Err(bad(form, "configuration must be a map"));
        };
        let mut opts = self.clone();
        for (key, value) in pairs {
            match &key.kind {
                FormKind::Keyword(k) if k == "verify" => opts.apply_verify(value)?,
                _ => return Err(bad(key, "unknown configuration key")),
            }
        }
        Ok(opts)
    }

    fn apply_verify(&mut self, form: &Form) -> Result<(), InstrumentationError> {
        let FormKind::Map(pairs) = &form.kind else {
            return Err(bad(form, ":verify must be a map"));
        };
        for (key, value) in pairs {
            match &key.kind {
                FormKind::Keyword(k) if k == "agreement" => {
                    self.verify_agreement = match &value.kind {
                        FormKind::Bool(false) => AgreementVerify::Off,
                        FormKind::Bool(true) => AgreementVerify::Decentralized,
                        FormKind::Sym(role) => AgreementVerify::Centralized(Role::new(role.as_str())),
                        _ => return Err(bad(value, ":agreement must be false, true, or a role")),
                    };
                }
                FormKind::Keyword(k) if k == "signature" => {
                    self.verify_signature = match &value.kind {
                        FormKind::Bool(false) => SignatureVerify::Off,
                        FormKind::Bool(true) => SignatureVerify::Block,
                        FormKind::Keyword(mode) if mode == "warn" => SignatureVerify::Warn,
                        FormKind::Keyword(mode) if mode == "block" => SignatureVerify::Block,
                        _ => return Err(bad(value, ":signature must be false, true, :warn, or :block")),
                    };
                }
                _ => return Err(bad(key, "unknown :verify option")),
            }
        }
        Ok(())
    }
}
