// Tests for the definition manager and configuration handling

use chorale::compiler::{alpha_equivalent, compile_str, CompileError, Context};
use chorale::config::{AgreementVerify, Options, SignatureVerify};
use chorale::form::read_one;
use chorale::Warning;

#[test]
fn test_forward_declaration_installs_signature_only() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor later [A B] (-> A [A B]))").expect("declares");
    let def = ctx.lookup("later").expect("installed");
    assert!(def.is_forward());
    assert_eq!(def.signature.rendered(), "(-> A [A B] | 0)");
}

#[test]
fn test_signature_change_warns_and_succeeds() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor f [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))").expect("compiles");
    ctx.take_warnings();
    compile_str(&ctx, "(defchor f [A B] (-> #{A B} #{A B}) [x] x)").expect("recompiles");
    let warnings = ctx.take_warnings();
    assert!(
        warnings.iter().any(|w| matches!(w, Warning::SignatureChanged { name, .. } if name == "f")),
        "expected a signature-changed warning, got {warnings:?}"
    );
    // The new definition won.
    assert_eq!(ctx.lookup("f").expect("defined").signature.rendered(), "(-> #{A B} #{A B} | 0)");
}

#[test]
fn test_alpha_equivalent_redefinition_does_not_warn() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor g [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))").expect("compiles");
    ctx.take_warnings();
    compile_str(&ctx, "(defchor g [X Y] (-> X X) [x] (Y->X (Y (inc (X->Y x)))))").expect("recompiles");
    let warnings = ctx.take_warnings();
    assert!(
        !warnings.iter().any(|w| matches!(w, Warning::SignatureChanged { .. })),
        "alpha-equivalent signatures must not warn, got {warnings:?}"
    );
}

#[test]
fn test_alpha_equivalence_is_positional() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor h1 [A B] (-> A B | 0) [x] (A->B x))").expect("compiles");
    compile_str(&ctx, "(defchor h2 [Y X] (-> Y X | 0) [x] (Y->X x))").expect("compiles");
    let h1 = ctx.lookup("h1").expect("defined");
    let h2 = ctx.lookup("h2").expect("defined");
    assert!(alpha_equivalent(&h1, &h2));
}

#[test]
fn test_failed_definition_rolls_back() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor keep [A B] (-> A A) [x] (A (inc x)))").expect("compiles");
    ctx.take_warnings();
    let err = compile_str(&ctx, "(defchor keep [A B] (-> A B) [x] x)").expect_err("body is ill-typed");
    assert!(matches!(err, CompileError::Type(_)));
    // The previous definition survives a failed recompile.
    let def = ctx.lookup("keep").expect("still defined");
    assert_eq!(def.signature.rendered(), "(-> A A | 0)");
    assert!(!def.is_forward());
}

#[test]
fn test_failed_first_definition_leaves_no_entry() {
    let ctx = Context::new();
    let err = compile_str(&ctx, "(defchor ghost [A B] (-> A B) [x] x)").expect_err("ill-typed");
    assert!(matches!(err, CompileError::Type(_)));
    assert!(ctx.lookup("ghost").is_none());
}

#[test]
fn test_filling_a_forward_declaration() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor fill [A B] (-> A #{A B}))").expect("declares");
    compile_str(&ctx, "(defchor fill [A B] (-> A #{A B}) [x] (A=>B x))").expect("fills");
    let def = ctx.lookup("fill").expect("defined");
    assert!(!def.is_forward());
}

#[test]
fn test_options_reject_unknown_keys() {
    let opts = Options::default();
    assert!(opts.updated(&read_one("{:verify {:agreement true}}").expect("readable")).is_ok());
    assert!(opts.updated(&read_one("{:frobnicate 1}").expect("readable")).is_err());
    assert!(opts.updated(&read_one("{:verify {:agreement 3}}").expect("readable")).is_err());
    assert!(opts.updated(&read_one("{:verify {:signature :sometimes}}").expect("readable")).is_err());
    assert!(opts.updated(&read_one("[:verify]").expect("readable")).is_err());
}

#[test]
fn test_options_parse_modes() {
    let opts = Options::default()
        .updated(&read_one("{:verify {:agreement C :signature :warn}}").expect("readable"))
        .expect("valid");
    assert_eq!(opts.verify_agreement, AgreementVerify::Centralized(chorale::Role::new("C")));
    assert_eq!(opts.verify_signature, SignatureVerify::Warn);
}

#[test]
fn test_with_opts_scopes_and_alter_opts_persists() {
    let ctx = Context::new();
    compile_str(
        &ctx,
        "(with-opts {:verify {:signature true}}
           (defchor scoped [A B] (-> A A) [x] (A (inc x))))",
    )
    .expect("compiles");
    // Outside the scope the default is restored.
    assert_eq!(ctx.opts().verify_signature, SignatureVerify::Off);

    compile_str(&ctx, "(alter-opts! {:verify {:signature :warn}})").expect("alters");
    assert_eq!(ctx.opts().verify_signature, SignatureVerify::Warn);
    ctx.take_warnings();
}

#[test]
fn test_bad_config_is_an_instrumentation_error() {
    let ctx = Context::new();
    let err = compile_str(&ctx, "(with-opts {:verify {:nope 1}} (defchor z [A B] (-> A A) [x] x))")
        .expect_err("rejected");
    assert!(matches!(err, CompileError::Instrumentation(_)));
}
