// Tests for the choreographic type representation

use std::collections::HashMap;

use chorale::ast::types::{parse_type, Aux, Type};
use chorale::ast::{role_set, Role};
use chorale::form::read_one;
use proptest::prelude::*;

fn parse(src: &str) -> Type {
    parse_type(&read_one(src).expect("readable type")).expect("parseable type")
}

#[test]
fn test_parse_role_atom() {
    assert_eq!(parse("A"), Type::agree_one("A"));
}

#[test]
fn test_parse_agreement_set() {
    assert_eq!(parse("#{A B}"), Type::Agree { roles: role_set(["A", "B"]) });
}

#[test]
fn test_parse_tuple() {
    let t = parse("[A #{A B}]");
    let Type::Tuple { elems } = &t else {
        panic!("expected a tuple, got {t:?}");
    };
    assert_eq!(elems.len(), 2);
}

#[test]
fn test_parse_chor_with_aux() {
    let t = parse("(-> A B | C)");
    let Type::Chor { params, ret, aux } = &t else {
        panic!("expected a chor type");
    };
    assert_eq!(params.len(), 1);
    assert_eq!(**ret, Type::agree_one("B"));
    assert_eq!(*aux, Aux::Roles(role_set(["C"])));
}

#[test]
fn test_parse_chor_empty_aux() {
    let t = parse("(-> A B | 0)");
    let Type::Chor { aux, .. } = &t else {
        panic!("expected a chor type");
    };
    assert_eq!(*aux, Aux::Roles(Default::default()));
}

#[test]
fn test_parse_chor_unspecified_aux() {
    let t = parse("(-> A B)");
    let Type::Chor { aux, .. } = &t else {
        panic!("expected a chor type");
    };
    assert_eq!(*aux, Aux::Unspecified);
}

#[test]
fn test_parse_rejects_malformed() {
    for src in [
        "#{}",
        "[]",
        "(A B)",
        "(->)",
        "(-> A B | 0 C)",
        "(-> A B | C C)",
        "#{A A}",
        "(-> A B |)",
        "42",
    ] {
        let form = read_one(src).expect("readable");
        assert!(parse_type(&form).is_err(), "{src} should be rejected");
    }
}

#[test]
fn test_roles_of_includes_aux() {
    let t = parse("(-> A B | C)");
    assert_eq!(t.roles_of(), role_set(["A", "B", "C"]));
}

#[test]
fn test_normalize_subtracts_primary_from_aux() {
    let t = parse("(-> A B | A B C)").normalize();
    let Type::Chor { aux, .. } = &t else {
        panic!("expected a chor type");
    };
    assert_eq!(*aux, Aux::Roles(role_set(["C"])));
}

#[test]
fn test_normalize_reaches_nested_chors() {
    let t = parse("(-> (-> A B | A C) D | 0)").normalize();
    let Type::Chor { params, .. } = &t else {
        panic!("expected a chor type");
    };
    let Type::Chor { aux, .. } = &params[0] else {
        panic!("expected a nested chor");
    };
    assert_eq!(*aux, Aux::Roles(role_set(["C"])));
}

#[test]
fn test_substitute_reaches_aux() {
    let subst: HashMap<Role, Role> =
        [(Role::new("A"), Role::new("X")), (Role::new("C"), Role::new("Y"))].into_iter().collect();
    let t = parse("(-> A B | C)").substitute(&subst);
    assert_eq!(t.roles_of(), role_set(["X", "B", "Y"]));
}

#[test]
fn test_render_round_trip_examples() {
    for src in ["A", "#{A B}", "[A B]", "(-> A B | 0)", "(-> #{A B} [A B] C | D)", "(-> (-> A B | 0) (-> B C | 0) (-> A C | B))"] {
        let t = parse(src);
        let back = parse_type(&t.render()).expect("rendered type parses");
        assert_eq!(back, t, "{src} does not round-trip");
    }
}

// Property tests

fn role_strategy() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::new("A")), Just(Role::new("B")), Just(Role::new("C")), Just(Role::new("D"))]
}

fn agree_strategy() -> impl Strategy<Value = Type> {
    proptest::collection::btree_set(role_strategy(), 1..4).prop_map(|roles| Type::Agree { roles })
}

fn type_strategy() -> impl Strategy<Value = Type> {
    agree_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..4).prop_map(|elems| Type::Tuple { elems }),
            (
                proptest::collection::vec(inner.clone(), 0..3),
                inner,
                prop_oneof![
                    Just(Aux::Unspecified),
                    proptest::collection::btree_set(role_strategy(), 0..3).prop_map(Aux::Roles),
                ],
            )
                .prop_map(|(params, ret, aux)| Type::Chor { params, ret: Box::new(ret), aux }),
        ]
    })
}

proptest! {
    /// parse(render(T)) == T for all well-formed types.
    #[test]
    fn prop_round_trip(t in type_strategy()) {
        let back = parse_type(&t.render()).expect("rendered type parses");
        prop_assert_eq!(back, t);
    }

    /// Normalization is idempotent.
    #[test]
    fn prop_normalize_idempotent(t in type_strategy()) {
        let once = t.normalize();
        prop_assert_eq!(once.clone().normalize(), once);
    }

    /// Substitution maps the role set through sigma, fixed points included.
    #[test]
    fn prop_substitution_preserves_shape(t in type_strategy()) {
        let subst: HashMap<Role, Role> = [
            (Role::new("A"), Role::new("X")),
            (Role::new("B"), Role::new("Y")),
        ]
        .into_iter()
        .collect();
        let expected: std::collections::BTreeSet<Role> = t
            .roles_of()
            .iter()
            .map(|r| subst.get(r).unwrap_or(r).clone())
            .collect();
        prop_assert_eq!(t.substitute(&subst).roles_of(), expected);
    }
}
