// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{
    evaluate, parse_entity_name, Configuration, EntityName, Expr, ExprMap, FunctionMap, JsonMode,
    NamedTarget, ReferenceKind, TargetNode, TargetResult,
};

use common::ArtifactDescription;
use serde_json::json;

fn from_json(value: serde_json::Value) -> Expr {
    Expr::from_json(&value)
}

fn config(value: serde_json::Value) -> Configuration {
    Configuration::new(from_json(value)).unwrap()
}

fn eval(expr: serde_json::Value, env: &Configuration) -> Expr {
    evaluate(&from_json(expr), env, &FunctionMap::new()).unwrap()
}

fn eval_err(expr: serde_json::Value, env: &Configuration) -> super::EvaluationError {
    evaluate(&from_json(expr), env, &FunctionMap::new()).unwrap_err()
}

#[test]
fn structurally_equal_values_share_a_hash() {
    let a = from_json(json!({"x": [1, "two", null], "y": true}));
    let b = from_json(json!({"x": [1, "two", null], "y": true}));
    assert_eq!(a.to_hash(), b.to_hash());
    assert_eq!(a, b);
}

#[test]
fn map_hash_depends_on_insertion_order() {
    let mut ab = ExprMap::new();
    ab.insert("a".to_string(), Expr::integer(1));
    ab.insert("b".to_string(), Expr::integer(2));
    let mut ba = ExprMap::new();
    ba.insert("b".to_string(), Expr::integer(2));
    ba.insert("a".to_string(), Expr::integer(1));
    assert_ne!(Expr::map(ab).to_hash(), Expr::map(ba).to_hash());
}

#[test]
fn hashes_distinguish_value_tags() {
    // A name and the list that happens to be its JSON rendering must not collide.
    let name = Expr::name(EntityName::Named(NamedTarget::target("", ".", "a")));
    let literal = from_json(name.to_json(JsonMode::SerializeAll));
    assert_ne!(name.to_hash(), literal.to_hash());

    let artifact = Expr::artifact(ArtifactDescription::local("a", ""));
    let literal = from_json(artifact.to_json(JsonMode::SerializeAll));
    assert_ne!(artifact.to_hash(), literal.to_hash());
}

#[test]
fn scalar_hashes_are_stable() {
    assert_eq!(Expr::none().to_hash(), Expr::none().to_hash());
    assert_ne!(Expr::bool(true).to_hash(), Expr::bool(false).to_hash());
    assert_ne!(Expr::integer(1).to_hash(), Expr::string("1").to_hash());
}

#[test]
fn names_are_not_cacheable() {
    let name = Expr::name(EntityName::Named(NamedTarget::target("", ".", "a")));
    assert!(!name.is_cacheable());
    // Containers inherit non-cacheability transitively.
    let list = Expr::list(vec![Expr::integer(1), name]);
    assert!(!list.is_cacheable());
    let mut map = ExprMap::new();
    map.insert("k".to_string(), list);
    assert!(!Expr::map(map).is_cacheable());
    assert!(from_json(json!([1, "two", {"three": null}])).is_cacheable());
}

#[test]
fn json_modes() {
    let result = TargetResult::new(Expr::empty_map(), Expr::empty_map(), Expr::empty_map());
    let node = Expr::node(TargetNode::Value(Expr::result(result)));
    assert_eq!(
        node.to_json(JsonMode::SerializeAllButNodes),
        json!({"type": "NODE", "id": node.to_hash().to_hex()})
    );
    assert_eq!(node.to_json(JsonMode::NullForNonJson), json!(null));
    assert_eq!(
        node.to_json(JsonMode::SerializeAll)["type"],
        json!("VALUE_NODE")
    );

    let artifact = Expr::artifact(ArtifactDescription::local("f", "r"));
    assert_eq!(artifact.to_json(JsonMode::NullForNonJson), json!(null));
    assert_eq!(artifact.to_json(JsonMode::SerializeAll)["type"], json!("LOCAL"));
}

#[test]
fn from_json_round_trip() {
    let value = json!({"a": [true, 0, "s", null], "b": {"c": []}});
    assert_eq!(from_json(value.clone()).to_json(JsonMode::SerializeAll), value);
}

#[test]
fn configuration_prune_is_order_independent() {
    let conf = config(json!({"A": "1", "B": "2", "C": "3"}));
    assert_eq!(conf.prune(["B", "A"]), conf.prune(["A", "B"]));
    assert_eq!(conf.prune(["A", "Z"]), conf.prune(["Z", "A", "A"]));
    // Unbound variables prune to null bindings.
    assert_eq!(conf.prune(["Z"]).at("Z"), Expr::none());
}

#[test]
fn configuration_update() {
    let conf = config(json!({"A": "1", "B": "2"}));
    let updated = conf.update(&from_json(json!({"B": "3", "C": "4"}))).unwrap();
    assert_eq!(updated.at("A"), Expr::string("1"));
    assert_eq!(updated.at("B"), Expr::string("3"));
    assert_eq!(updated.at("C"), Expr::string("4"));
    assert!(updated.is_fixed("C"));
    assert!(!updated.is_fixed("D"));
}

#[test]
fn literals_evaluate_to_themselves() {
    let env = Configuration::empty();
    assert_eq!(eval(json!(null), &env), Expr::none());
    assert_eq!(eval(json!(true), &env), Expr::bool(true));
    assert_eq!(eval(json!("foo"), &env), Expr::string("foo"));
    assert_eq!(eval(json!([1, 2]), &env), from_json(json!([1, 2])));
}

#[test]
fn var_and_default() {
    let env = config(json!({"FOO": "bar"}));
    assert_eq!(eval(json!({"type": "var", "name": "FOO"}), &env), Expr::string("bar"));
    assert_eq!(
        eval(json!({"type": "var", "name": "MISSING"}), &env),
        Expr::none()
    );
    assert_eq!(
        eval(
            json!({"type": "var", "name": "MISSING", "default": "fallback"}),
            &env
        ),
        Expr::string("fallback")
    );
}

#[test]
fn if_and_equality() {
    let env = config(json!({"MODE": "debug"}));
    let expr = json!({
        "type": "if",
        "cond": {"type": "==", "$1": {"type": "var", "name": "MODE"}, "$2": "debug"},
        "then": ["-g"],
        "else": ["-O2"],
    });
    assert_eq!(eval(expr, &env), from_json(json!(["-g"])));
}

#[test]
fn case_selects_lazily() {
    let env = config(json!({"MODE": "release"}));
    let expr = json!({
        "type": "case",
        "expr": {"type": "var", "name": "MODE"},
        "case": {
            "debug": ["-g"],
            // Never evaluated, so the failure never fires.
            "broken": {"type": "fail", "msg": "unreachable"},
            "release": ["-O2"],
        },
        "default": [],
    });
    assert_eq!(eval(expr, &env), from_json(json!(["-O2"])));
}

#[test]
fn let_star_binds_sequentially() {
    let env = Configuration::empty();
    let expr = json!({
        "type": "let*",
        "bindings": [
            ["x", "a"],
            ["y", {"type": "join", "$1": [{"type": "var", "name": "x"}, "b"]}],
        ],
        "body": {"type": "var", "name": "y"},
    });
    assert_eq!(eval(expr, &env), Expr::string("ab"));
}

#[test]
fn foreach_and_foreach_map() {
    let env = Configuration::empty();
    let expr = json!({
        "type": "foreach",
        "var": "f",
        "range": ["a", "b"],
        "body": {"type": "change_ending", "$1": {"type": "var", "name": "f"}, "ending": ".o"},
    });
    assert_eq!(eval(expr, &env), from_json(json!(["a.o", "b.o"])));

    let expr = json!({
        "type": "foreach_map",
        "range": {"x": "1", "y": "2"},
        "body": [{"type": "var", "name": "_"}, {"type": "var", "name": "$_"}],
    });
    assert_eq!(eval(expr, &env), from_json(json!([["x", "1"], ["y", "2"]])));
}

#[test]
fn map_union_later_wins_and_keeps_first_position() {
    let env = Configuration::empty();
    let expr = json!({"type": "map_union", "$1": [{"a": "1", "b": "2"}, {"a": "3", "c": "4"}]});
    let result = eval(expr, &env);
    let map = result.as_map().unwrap();
    let entries: Vec<(&str, &str)> = map
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str().unwrap()))
        .collect();
    assert_eq!(entries, vec![("a", "3"), ("b", "2"), ("c", "4")]);
}

#[test]
fn disjoint_map_union_rejects_conflicts() {
    let env = Configuration::empty();
    let err = eval_err(
        json!({"type": "disjoint_map_union", "$1": [{"a": "1"}, {"a": "2"}]}),
        &env,
    );
    assert!(err.message.contains("Conflicting values"), "{err}");
}

#[test]
fn keys_values_and_lookup() {
    let env = Configuration::empty();
    assert_eq!(
        eval(json!({"type": "keys", "$1": {"b": 1, "a": 2}}), &env),
        from_json(json!(["b", "a"]))
    );
    assert_eq!(
        eval(json!({"type": "values", "$1": {"b": 1, "a": 2}}), &env),
        from_json(json!([1, 2]))
    );
    assert_eq!(
        eval(
            json!({"type": "lookup", "key": "a", "map": {"a": "hit"}, "default": "miss"}),
            &env
        ),
        Expr::string("hit")
    );
    assert_eq!(
        eval(
            json!({"type": "lookup", "key": "z", "map": {"a": "hit"}, "default": "miss"}),
            &env
        ),
        Expr::string("miss")
    );
}

#[test]
fn concat_and_nub_right() {
    let env = Configuration::empty();
    assert_eq!(
        eval(json!({"type": "++", "$1": [["a"], ["b", "c"], []]}), &env),
        from_json(json!(["a", "b", "c"]))
    );
    assert_eq!(
        eval(json!({"type": "nub_right", "$1": ["a", "b", "a", "c", "b"]}), &env),
        from_json(json!(["a", "c", "b"]))
    );
}

#[test]
fn string_helpers() {
    let env = Configuration::empty();
    assert_eq!(
        eval(json!({"type": "basename", "$1": "foo/bar/baz.c"}), &env),
        Expr::string("baz.c")
    );
    assert_eq!(
        eval(json!({"type": "change_ending", "$1": "src/a.cpp", "ending": ".o"}), &env),
        Expr::string("src/a.o")
    );
    assert_eq!(
        eval(json!({"type": "change_ending", "$1": "Makefile", "ending": ".bak"}), &env),
        Expr::string("Makefile.bak")
    );
    assert_eq!(
        eval(
            json!({"type": "concat_target_name", "$1": ["./", "sub", "lib"], "$2": "-static"}),
            &env
        ),
        from_json(json!(["./", "sub", "lib-static"]))
    );
}

#[test]
fn to_subdir_normalizes_and_detects_conflicts() {
    let env = Configuration::empty();
    let result = eval(
        json!({"type": "to_subdir", "subdir": "out", "$1": {"./a": "x", "b/../c": "y"}}),
        &env,
    );
    let map = result.as_map().unwrap();
    assert!(map.contains_key("out/a"));
    assert!(map.contains_key("out/c"));

    let err = eval_err(
        json!({"type": "to_subdir", "subdir": "out", "flat": true,
               "$1": {"x/name": "1", "y/name": "2"}}),
        &env,
    );
    assert!(err.message.contains("staging conflict"), "{err}");
}

#[test]
fn arithmetic() {
    let env = Configuration::empty();
    assert_eq!(eval(json!({"type": "+", "$1": [1, 2, 3]}), &env), Expr::integer(6));
    assert_eq!(eval(json!({"type": "*", "$1": [2, 3, 4]}), &env), Expr::integer(24));
    assert_eq!(eval(json!({"type": "+", "$1": []}), &env), Expr::integer(0));
}

#[test]
fn errors_carry_the_form_chain() {
    let env = Configuration::empty();
    let err = eval_err(
        json!({
            "type": "let*",
            "bindings": [["x", {"type": "join", "$1": [1]}]],
            "body": null,
        }),
        &env,
    );
    assert!(err.message.contains("list of strings"), "{err}");
    assert_eq!(err.call_stack, vec!["join".to_string(), "let*".to_string()]);
}

#[test]
fn unknown_forms_are_errors() {
    let env = Configuration::empty();
    let err = eval_err(json!({"type": "no_such_form"}), &env);
    assert!(err.message.contains("Unknown syntactical construct"), "{err}");
}

#[test]
fn typeless_maps_are_literals_evaluated_entry_wise() {
    let env = config(json!({"MODE": "debug"}));
    assert_eq!(
        eval(json!([{"exists": true}]), &env),
        from_json(json!([{"exists": true}]))
    );
    assert_eq!(
        eval(json!({"mode": {"type": "var", "name": "MODE"}}), &env),
        from_json(json!({"mode": "debug"}))
    );
}

#[test]
fn caller_functions_extend_dispatch() {
    let mut functions = FunctionMap::new();
    functions.insert("REVERSE", |eval, form, env| {
        let arg = eval.eval_arg(form, "$1", Expr::empty_list(), env)?;
        let mut entries = arg.as_list().unwrap_or(&[]).to_vec();
        entries.reverse();
        Ok(Expr::list(entries))
    });
    let result = evaluate(
        &from_json(json!({"type": "REVERSE", "$1": ["a", "b", "c"]})),
        &Configuration::empty(),
        &functions,
    )
    .unwrap();
    assert_eq!(result, from_json(json!(["c", "b", "a"])));
}

#[test]
fn entity_name_grammar() {
    let current = NamedTarget::target("repo", "mod", "requesting");
    let parse = |value: serde_json::Value| parse_entity_name(&from_json(value), &current);

    assert_eq!(
        parse(json!("dep")).unwrap(),
        EntityName::Named(NamedTarget::target("repo", "mod", "dep"))
    );
    assert_eq!(
        parse(json!(["./", "sub", "dep"])).unwrap(),
        EntityName::Named(NamedTarget::target("repo", "mod/sub", "dep"))
    );
    assert_eq!(
        parse(json!(["FILE", null, "main.c"])).unwrap(),
        EntityName::Named(NamedTarget::new("repo", "mod", "main.c", ReferenceKind::File))
    );
    assert_eq!(
        parse(json!(["TREE", null, "assets"])).unwrap(),
        EntityName::Named(NamedTarget::new("repo", "mod", "assets", ReferenceKind::Tree))
    );
    assert_eq!(
        parse(json!(["@", "other", "lib", "dep"])).unwrap(),
        EntityName::Named(NamedTarget::target("other", "lib", "dep"))
    );

    // Only the five forms above name entities.
    parse(json!(["mod", "dep"])).expect_err("Want err");
    parse(json!(["FILE", "mod", "main.c"])).expect_err("Want err");
    parse(json!(42)).expect_err("Want err");
    parse(json!(["@", "repo", "mod"])).expect_err("Want err");
}

#[test]
fn fail_halts_evaluation() {
    let env = Configuration::empty();
    let err = eval_err(
        json!(["ok", {"type": "fail", "msg": "boom"}, {"type": "fail", "msg": "unseen"}]),
        &env,
    );
    assert_eq!(err.message, "boom");
}
