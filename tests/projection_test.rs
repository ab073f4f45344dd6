// Tests for endpoint projection and the cleanup pass

use chorale::ast::env::Env;
use chorale::ast::Role;
use chorale::compiler::{check, cleanup, compile_str, is_noop, project, Context, Parser};
use chorale::form::read_one;

fn roles(names: &[&str]) -> Vec<Role> {
    names.iter().map(|n| Role::new(*n)).collect()
}

fn project_expr(src: &str, scope: &[&str], target: &str) -> chorale::Form {
    let ctx = Context::new();
    let env = Env::top(roles(scope));
    let mut node = Parser::new(&ctx).parse(&read_one(src).expect("readable"), &env).expect("parses");
    check(&ctx, &mut node).expect("checks");
    let form = project(&ctx, &env.roles, &node, &Role::new(target)).expect("projects");
    cleanup(form)
}

#[test]
fn test_unmentioned_role_projects_to_noop() {
    // The projection mentions property: no mention, exactly the sentinel.
    for src in ["(A 1)", "(A=>B (A 1))", "(narrow [A] (lifting [A B] 1))", "(pack (A 1) (B 2))"] {
        let form = project_expr(src, &["A", "B", "C"], "C");
        assert!(is_noop(&form), "{src} at C should be noop, got {form}");
    }
}

#[test]
fn test_copy_projects_to_send_and_recv() {
    let at_a = project_expr("(A=>B (A 5))", &["A", "B"], "A");
    assert_eq!(at_a.to_string(), "(send! 1 5)");
    let at_b = project_expr("(A=>B (A 5))", &["A", "B"], "B");
    assert_eq!(at_b.to_string(), "(recv! 0)");
}

#[test]
fn test_narrow_keeps_effects_for_dropped_roles() {
    // A sends, keeps no result, and ends in the sentinel.
    let at_a = project_expr("(A->B (A 5))", &["A", "B"], "A");
    assert_eq!(at_a.to_string(), "(do (send! 1 5) noop)");
    let at_b = project_expr("(A->B (A 5))", &["A", "B"], "B");
    assert_eq!(at_b.to_string(), "(recv! 0)");
}

#[test]
fn test_pack_keeps_only_positions_with_results() {
    let at_a = project_expr("(pack (A 1) (B 2))", &["A", "B"], "A");
    assert_eq!(at_a.to_string(), "[1]");
    let at_b = project_expr("(pack (A 1) (B 2))", &["A", "B"], "B");
    assert_eq!(at_b.to_string(), "[2]");
}

#[test]
fn test_pack_orders_effects_between_values() {
    // The A->B transfer is an effect at A interleaved between kept values.
    let at_a = project_expr("(pack (A 1) (A->B (A 2)) (A 3))", &["A", "B"], "A");
    let text = at_a.to_string();
    assert!(text.starts_with("(let ["), "{text}");
    assert!(text.contains("(send! 1 2)"), "{text}");
}

#[test]
fn test_if_projects_guard_effects_for_outsiders() {
    let src = "(if (B=>A (B true)) (A 1) (A 2))";
    let at_a = project_expr(src, &["A", "B"], "A");
    assert_eq!(at_a.to_string(), "(if (recv! 1) 1 2)");
    // B feeds the guard but takes no branch.
    let at_b = project_expr(src, &["A", "B"], "B");
    assert_eq!(at_b.to_string(), "(do (send! 0 true) noop)");
}

#[test]
fn test_agree_picks_the_local_result() {
    let src = "(agree! (A 1) (B 1))";
    assert_eq!(project_expr(src, &["A", "B"], "A").to_string(), "1");
    assert_eq!(project_expr(src, &["A", "B"], "B").to_string(), "1");
}

#[test]
fn test_chor_parameters_erase_per_role() {
    let src = "(chor (-> A B B | 0) [x y] (do x y))";
    let at_a = project_expr(src, &["A", "B"], "A");
    let at_b = project_expr(src, &["A", "B"], "B");
    let a_text = at_a.to_string();
    let b_text = at_b.to_string();
    assert!(a_text.starts_with("(fn ["), "{a_text}");
    // A keeps only x, B keeps only y.
    let params = |s: &str| s.split('[').nth(1).unwrap().split(']').next().unwrap().to_string();
    assert!(params(&a_text).contains('x'), "{a_text}");
    assert!(!params(&a_text).contains('y'), "{a_text}");
    assert!(params(&b_text).contains('y'), "{b_text}");
}

#[test]
fn test_definition_projection_shapes() {
    let ctx = Context::new();
    let defs =
        compile_str(&ctx, "(defchor inc-at [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))").expect("compiles");
    let def = &defs[0];
    let projections = def.projections.as_ref().expect("projected");
    let at_a = projections[0].to_string();
    let at_b = projections[1].to_string();
    assert!(at_a.contains("(send! 1"), "{at_a}");
    assert!(at_a.contains("(recv! 1)"), "{at_a}");
    assert!(at_b.contains("(recv! 0)"), "{at_b}");
    assert!(at_b.contains("(send! 0"), "{at_b}");
    // Communication order at A: send the argument, then await the answer.
    assert!(at_a.find("send!").unwrap() < at_a.find("recv!").unwrap(), "{at_a}");
}

#[test]
fn test_unused_role_projection_is_noop() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, "(defchor solo [A B C] (-> A A) [x] (A (inc x)))").expect("compiles");
    let projections = defs[0].projections.as_ref().expect("projected");
    assert!(is_noop(&projections[1]));
    assert!(is_noop(&projections[2]));
    ctx.take_warnings();
}

#[test]
fn test_instantiation_emits_make_proj_with_mapping() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor step [X Y] (-> X Y) [v] (X->Y v))").expect("compiles");
    let defs = compile_str(&ctx, "(defchor flip [A B] (-> B A) [v] (step [B A] v))").expect("compiles");
    let projections = defs[0].projections.as_ref().expect("projected");
    // A plays step's Y, which is position 1; the mapping sends step's X to
    // locator 1 (B) and step's Y to locator 0 (A).
    let at_a = projections[0].to_string();
    assert!(at_a.contains("(make-proj (quote step) 1 [1 0])"), "{at_a}");
}

#[test]
fn test_unordered_collection_with_communication_warns() {
    let ctx = Context::new();
    compile_str(
        &ctx,
        "(defchor t [A B] (-> #{A B} #{A B}) [x] #{(A=>B (A 1)) (B=>A (B 2))})",
    )
    .expect("compiles");
    let warnings = ctx.take_warnings();
    assert!(
        warnings.iter().any(|w| matches!(w, chorale::Warning::UnorderedCommunication { .. })),
        "expected an unordered-communication warning, got {warnings:?}"
    );
}

#[test]
fn test_cleanup_folds_do_blocks() {
    let form = cleanup(read_one("(do 1 (do (send! 1 2) 3) x)").expect("readable"));
    assert_eq!(form.to_string(), "(do (send! 1 2) x)");
}

#[test]
fn test_cleanup_removes_pure_statements() {
    let form = cleanup(read_one("(do 1 :kw [1 2] x)").expect("readable"));
    assert_eq!(form.to_string(), "x");
}

#[test]
fn test_cleanup_removes_empty_lets() {
    let form = cleanup(read_one("(let [] (recv! 0))").expect("readable"));
    assert_eq!(form.to_string(), "(recv! 0)");
}

#[test]
fn test_cleanup_drops_pure_effect_bindings() {
    let form = cleanup(read_one("(let [_ 1 x (recv! 0)] x)").expect("readable"));
    assert_eq!(form.to_string(), "(let [x (recv! 0)] x)");
}
