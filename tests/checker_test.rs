// Tests for the choreographic type checker

use chorale::compiler::{compile_str, CompileError, Context};

fn compile(src: &str) -> Result<String, CompileError> {
    let ctx = Context::new();
    let defs = compile_str(&ctx, src)?;
    Ok(defs.last().map(|d| d.signature.rendered()).unwrap_or_default())
}

fn assert_type_error(src: &str) {
    match compile(src) {
        Err(CompileError::Type(_)) => {}
        other => panic!("expected a type error for {src}, got {other:?}"),
    }
}

#[test]
fn test_increment_signature_infers_aux() {
    let sig = compile("(defchor inc-at [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))")
        .expect("compiles");
    assert_eq!(sig, "(-> A A | B)");
}

#[test]
fn test_definition_may_shadow_a_builtin_name() {
    // The call in ordinary position still resolves to the host builtin.
    let sig =
        compile("(defchor inc [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))").expect("compiles");
    assert_eq!(sig, "(-> A A | B)");
}

#[test]
fn test_copy_needs_source_holding_the_value() {
    assert_type_error("(defchor t [A B] (-> A #{A B}) [x] (copy [B A] x))");
}

#[test]
fn test_copy_rejects_destination_already_holding() {
    assert_type_error("(defchor t [A B] (-> #{A B} #{A B}) [x] (copy [A B] x))");
}

#[test]
fn test_narrow_must_shrink_the_agreement() {
    assert_type_error("(defchor t [A B] (-> A B) [x] (narrow [B] x))");
}

#[test]
fn test_if_branches_must_agree() {
    assert_type_error("(defchor t [A B] (-> #{A B} A) [x] (if x (A 1) (B 2)))");
}

#[test]
fn test_if_guard_must_be_an_agreement() {
    assert_type_error("(defchor t [A B] (-> #{A B} A) [x] (if (pack x) (A 1) (A 2)))");
}

#[test]
fn test_knowledge_of_choice_accepts_shared_guard() {
    compile("(defchor c [A B] (-> #{A B} A) [x] (if (even? x) (A 1) (A 2)))").expect("compiles");
}

#[test]
fn test_knowledge_of_choice_rejects_private_guard() {
    // The guard collapses to A while B is still involved in the test.
    assert_type_error("(defchor c [A B] (-> #{A B} A) [x] (if (A (even? x)) (A 1) (A 2)))");
}

#[test]
fn test_knowledge_of_choice_rejects_acting_outsider() {
    assert_type_error(
        "(defchor c [A B] (-> A A) [x] (if (A (even? x)) (A 1) (do (B 2) (A 1))))",
    );
}

#[test]
fn test_agree_requires_disjoint_sets() {
    assert_type_error("(defchor t [A B] (-> #{A B} #{A B}) [x] (agree! x (A 1)))");
}

#[test]
fn test_agree_joins_disjoint_sets() {
    let sig = compile("(defchor t [A B] (-> A B #{A B}) [x y] (agree! x y))").expect("compiles");
    assert_eq!(sig, "(-> A B #{A B} | 0)");
}

#[test]
fn test_invoke_argument_must_cover_operator_agreement() {
    // inc runs at #{A B} but its argument lives only at A.
    assert_type_error("(defchor t [A B] (-> A #{A B}) [x] (inc x))");
}

#[test]
fn test_invoke_of_tuple_is_an_error() {
    assert_type_error("(defchor t [A B] (-> A A) [x] ((pack x) x))");
}

#[test]
fn test_chor_invoke_checks_arity() {
    assert_type_error(
        "(defchor t [A B] (-> A A) [x] ((chor (-> A A A | 0) [u v] u) x))",
    );
}

#[test]
fn test_unpack_shape_mismatch() {
    assert_type_error("(defchor t [A B] (-> A A) [x] (unpack [[u v] (pack x)] u))");
}

#[test]
fn test_unpack_reads_position_types() {
    let sig = compile(
        "(defchor t [A B] (-> A B [B A]) [x y] (unpack [[u v] (pack (A->B x) (B->A y))] (pack u v)))",
    )
    .expect("compiles");
    assert_eq!(sig, "(-> A B [B A] | 0)");
}

#[test]
fn test_higher_order_compose() {
    let sig = compile(
        "(defchor compose [A B C] (-> (-> B C) (-> A B) (-> A C | B)) [g f] \
           (chor (-> A C | B) [x] (g (f x))))",
    )
    .expect("compiles");
    assert_eq!(sig, "(-> (-> B C | 0) (-> A B | 0) (-> A C | B) | 0)");
}

#[test]
fn test_nested_chor_requires_explicit_aux() {
    assert_type_error(
        "(defchor compose [A B C] (-> (-> B C) (-> A B) (-> A C | B)) [g f] \
           (chor (-> A C) [x] (g (f x))))",
    );
}

#[test]
fn test_declared_aux_must_match_computed() {
    assert_type_error("(defchor t [A B] (-> A A | 0) [x] (B->A (B (inc (A->B x)))))");
}

#[test]
fn test_fn_body_is_homogeneous() {
    assert_type_error("(defchor t [A B] (-> #{A B} #{A B}) [x] ((fn [y] (narrow [A] x)) x))");
}

#[test]
fn test_fn_at_mask_compiles() {
    compile("(defchor t [A B] (-> #{A B} #{A B}) [x] ((fn [y] (inc y)) x))").expect("compiles");
}

#[test]
fn test_collection_elements_at_mask() {
    assert_type_error("(defchor t [A B] (-> #{A B} #{A B}) [x] [x (narrow [A] x)])");
}

#[test]
fn test_recur_checks_argument_types() {
    assert_type_error(
        "(defchor t [A B] (-> #{A B} #{A B}) [x] (if (zero? x) x (recur (narrow [A] x))))",
    );
}

#[test]
fn test_type_errors_carry_the_offending_form() {
    let ctx = Context::new();
    let err = compile_str(&ctx, "(defchor t [A B] (-> A B) [x] x)").expect_err("rejected");
    let CompileError::Type(e) = err else {
        panic!("expected a type error");
    };
    assert!(!e.form.to_string().is_empty());
}

#[test]
fn test_unused_role_parameter_warns() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor t [A B] (-> A A) [x] (A (inc x)))").expect("compiles");
    let warnings = ctx.take_warnings();
    assert!(
        warnings.iter().any(|w| matches!(w, chorale::Warning::UnusedRoleParam { role, .. } if role.name() == "B")),
        "expected an unused-role warning, got {warnings:?}"
    );
}
