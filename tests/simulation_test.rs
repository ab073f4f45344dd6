// End-to-end simulation tests
//
// Compile definitions, run every role concurrently on the in-memory
// network, and check per-role results and the communication log.

use chorale::compiler::{compile_str, Context};
use chorale::runtime::{simulate, RuntimeError, Value};

fn int(n: i64) -> Value {
    Value::Int(n)
}

fn kw(name: &str) -> Value {
    Value::Keyword(name.to_string())
}

fn string(s: &str) -> Value {
    Value::Str(s.to_string())
}

#[tokio::test]
async fn test_increment_round_trip() {
    let ctx = Context::new();
    // The definition shares its name with the host builtin it calls.
    let defs = compile_str(&ctx, "(defchor inc [A B] (-> A A) [x] (B->A (B (inc (A->B x)))))")
        .expect("compiles");
    let sim = simulate(&ctx, &defs[0], vec![vec![int(5)], vec![]]).await.expect("simulates");
    let log = sim.log_strings(&defs[0]);
    let values = sim.values().expect("all roles succeed");
    assert_eq!(values, vec![int(6), Value::Noop]);
    assert_eq!(log, vec!["A->B:5", "B->A:6"]);
}

#[tokio::test]
async fn test_buy_book_happy_path() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        r#"(defchor buy-book [B S] (-> B S B) [order catalog]
             (let [title (B->S (B (get order :title)))
                   price (S->B (S (get catalog title)))
                   ok    (B=>S (B (<= price (get order :budget))))]
               (if ok
                   (let [addr (B->S (B (get order :address)))]
                     (S->B (S (str "shipping to " addr " on 2026-08-09"))))
                   (B nil))))"#,
    )
    .expect("compiles");
    let order = Value::Map(vec![
        (kw("title"), string("X")),
        (kw("budget"), int(50)),
        (kw("address"), string("a")),
    ]);
    let catalog = Value::Map(vec![(string("X"), int(50))]);
    let sim = simulate(&ctx, &defs[0], vec![vec![order], vec![catalog]]).await.expect("simulates");
    let log = sim.log_strings(&defs[0]);
    assert_eq!(
        log,
        vec!["B->S:X", "S->B:50", "B->S:true", "B->S:a", "S->B:shipping to a on 2026-08-09"]
    );
    let values = sim.values().expect("all roles succeed");
    assert_eq!(values, vec![string("shipping to a on 2026-08-09"), Value::Noop]);
}

#[tokio::test]
async fn test_buy_book_rejects_over_budget() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        r#"(defchor buy-book [B S] (-> B S B) [order catalog]
             (let [title (B->S (B (get order :title)))
                   price (S->B (S (get catalog title)))
                   ok    (B=>S (B (<= price (get order :budget))))]
               (if ok
                   (let [addr (B->S (B (get order :address)))]
                     (S->B (S (str "shipping to " addr " on 2026-08-09"))))
                   (B nil))))"#,
    )
    .expect("compiles");
    let order = Value::Map(vec![
        (kw("title"), string("X")),
        (kw("budget"), int(10)),
        (kw("address"), string("a")),
    ]);
    let catalog = Value::Map(vec![(string("X"), int(50))]);
    let sim = simulate(&ctx, &defs[0], vec![vec![order], vec![catalog]]).await.expect("simulates");
    let log_len = sim.log.len();
    let values = sim.values().expect("all roles succeed");
    assert_eq!(values, vec![Value::Nil, Value::Noop]);
    assert_eq!(log_len, 3);
}

const DIFFIE_HELLMAN: &str = r#"(defchor exchange-key [A B]
      (-> #{A B} #{A B} A B #{A B})
      [g p sa sb]
      (agree! (A (modpow (B->A (B (modpow g sb p))) sa p))
              (B (modpow (A->B (A (modpow g sa p))) sb p))))"#;

#[tokio::test]
async fn test_diffie_hellman_agreement() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, DIFFIE_HELLMAN).expect("compiles");
    let sim = simulate(
        &ctx,
        &defs[0],
        vec![vec![int(5), int(23), int(4)], vec![int(5), int(23), int(3)]],
    )
    .await
    .expect("simulates");
    let values = sim.values().expect("all roles succeed");
    // Both roles hold equal copies of the shared key.
    assert_eq!(values, vec![int(18), int(18)]);
}

#[tokio::test]
async fn test_agreement_verification_catches_divergence() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        "(with-opts {:verify {:agreement true}}
           (defchor settle [A B] (-> A B #{A B}) [x y] (agree! x y)))",
    )
    .expect("compiles");

    // Matching copies pass the inserted check.
    let sim = simulate(&ctx, &defs[0], vec![vec![int(7)], vec![int(7)]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(7), int(7)]);

    // Divergent copies raise the same error at every role.
    let sim = simulate(&ctx, &defs[0], vec![vec![int(7)], vec![int(8)]]).await.expect("simulates");
    for result in &sim.results {
        assert!(
            matches!(result, Err(RuntimeError::AgreementMismatch { observed, .. })
                if observed.contains(&int(7)) && observed.contains(&int(8))),
            "expected a uniform agreement mismatch, got {result:?}"
        );
    }
}

#[tokio::test]
async fn test_agreement_verification_centralized() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        "(with-opts {:verify {:agreement B}}
           (defchor settle [A B] (-> A B #{A B}) [x y] (agree! x y)))",
    )
    .expect("compiles");
    let sim = simulate(&ctx, &defs[0], vec![vec![int(1)], vec![int(2)]]).await.expect("simulates");
    for result in &sim.results {
        assert!(matches!(result, Err(RuntimeError::AgreementMismatch { .. })), "{result:?}");
    }
    let sim = simulate(&ctx, &defs[0], vec![vec![int(3)], vec![int(3)]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(3), int(3)]);
}

#[tokio::test]
async fn test_verified_parameters_catch_mismatched_inputs() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, &format!("(with-opts {{:verify {{:agreement true}}}} {DIFFIE_HELLMAN})"))
        .expect("compiles");
    // A and B disagree about the shared generator g.
    let sim = simulate(
        &ctx,
        &defs[0],
        vec![vec![int(5), int(23), int(4)], vec![int(6), int(23), int(3)]],
    )
    .await
    .expect("simulates");
    for result in &sim.results {
        assert!(
            matches!(result, Err(RuntimeError::AgreementMismatch { param, .. }) if param == "g"),
            "expected a uniform mismatch on g, got {result:?}"
        );
    }
}

#[tokio::test]
async fn test_knowledge_of_choice_example_runs() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, "(defchor choose [A B] (-> #{A B} A) [x] (if (even? x) (A 1) (A 2)))")
        .expect("compiles");
    let sim = simulate(&ctx, &defs[0], vec![vec![int(4)], vec![int(4)]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(1), Value::Noop]);
    let sim = simulate(&ctx, &defs[0], vec![vec![int(5)], vec![int(5)]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(2), Value::Noop]);
}

#[tokio::test]
async fn test_forward_declaration_and_mutual_recursion() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        r#"(defchor m2 [A B] (-> A [A B]))
           (defchor m1 [A B] (-> A [A B]) [n]
             (if (B=>A (B (zero? (A->B n))))
                 (pack (A :done) (B nil))
                 (m2 [A B] (A (dec n)))))
           (defchor m2 [A B] (-> A [A B]) [n]
             (if (B=>A (B (zero? (A->B n))))
                 (pack (A :done) (B nil))
                 (m1 [A B] (A (dec n)))))"#,
    )
    .expect("compiles");
    assert!(ctx.take_warnings().is_empty(), "alpha-equivalent redefinition must not warn");
    let m1 = defs.iter().find(|d| d.name == "m1").expect("m1 defined");
    let sim = simulate(&ctx, m1, vec![vec![int(5)], vec![]]).await.expect("simulates");
    let log_len = sim.log.len();
    let values = sim.values().expect("all roles succeed");
    assert_eq!(values, vec![kw("done"), Value::Nil]);
    // Six alternating round trips: n and the verdict per call.
    assert_eq!(log_len, 12);
}

#[tokio::test]
async fn test_self_recursion_through_the_registry() {
    let ctx = Context::new();
    let defs = compile_str(
        &ctx,
        "(defchor count-down [A B] (-> #{A B} #{A B}) [x]
           (if (zero? x) x (count-down [A B] (dec x))))",
    )
    .expect("compiles");
    let sim = simulate(&ctx, &defs[0], vec![vec![int(3)], vec![int(3)]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(0), int(0)]);
}

#[tokio::test]
async fn test_tuple_return_erasure() {
    let ctx = Context::new();
    let defs = compile_str(&ctx, "(defchor swap [A B] (-> A B [B A]) [x y] (pack (A->B x) (B->A y)))")
        .expect("compiles");
    let sim = simulate(&ctx, &defs[0], vec![vec![int(1)], vec![int(2)]]).await.expect("simulates");
    // Each role keeps only its own tuple position, unwrapped.
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(2), int(1)]);
}

#[tokio::test]
async fn test_signature_verification_blocks_after_redefinition() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor twice [A B] (-> A A) [x] (B->A (B (* 2 (A->B x)))))").expect("compiles");
    let caller = compile_str(
        &ctx,
        "(with-opts {:verify {:signature true}}
           (defchor run-twice [A B] (-> A A) [x] (twice [A B] x)))",
    )
    .expect("compiles");
    // Redefine the callee with a structurally different signature.
    compile_str(&ctx, "(defchor twice [A B] (-> #{A B} #{A B}) [x] (* 2 x))").expect("compiles");
    assert!(ctx
        .take_warnings()
        .iter()
        .any(|w| matches!(w, chorale::Warning::SignatureChanged { name, .. } if name == "twice")));

    let sim = simulate(&ctx, &caller[0], vec![vec![int(3)], vec![]]).await.expect("simulates");
    assert!(
        sim.results
            .iter()
            .all(|r| matches!(r, Err(RuntimeError::SignatureChanged { name, .. }) if name == "twice")),
        "every role must refuse to run against the drifted signature"
    );
}

#[tokio::test]
async fn test_signature_verification_warn_mode_keeps_running() {
    let ctx = Context::new();
    compile_str(&ctx, "(defchor shout [A B] (-> A A) [x] (B->A (B (* 10 (A->B x)))))").expect("compiles");
    let caller = compile_str(
        &ctx,
        "(with-opts {:verify {:signature :warn}}
           (defchor run-shout [A B] (-> A A) [x] (shout [A B] x)))",
    )
    .expect("compiles");
    // An alpha-equivalent recompile drifts nothing; warn mode stays silent
    // and the run still succeeds.
    compile_str(&ctx, "(defchor shout [X Y] (-> X X) [x] (Y->X (Y (* 10 (X->Y x)))))").expect("compiles");
    let sim = simulate(&ctx, &caller[0], vec![vec![int(4)], vec![]]).await.expect("simulates");
    assert_eq!(sim.values().expect("all roles succeed"), vec![int(40), Value::Noop]);
}

#[tokio::test]
async fn test_transport_failure_surfaces_as_runtime_error() {
    let ctx = Context::new();
    // B throws before sending; A's receive observes the closed channel.
    let bad = compile_str(&ctx, "(defchor expect [A B] (-> B A) [x] (do (B (throw :boom)) (B->A x)))")
        .expect("compiles");
    let sim = simulate(&ctx, &bad[0], vec![vec![], vec![int(1)]]).await.expect("simulates");
    assert!(matches!(sim.results[1], Err(RuntimeError::Thrown(_))), "{:?}", sim.results[1]);
    assert!(matches!(sim.results[0], Err(RuntimeError::Transport(_))), "{:?}", sim.results[0]);
}
