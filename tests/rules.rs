//! Rule table construction and matching properties.

use divvy::{config, ConfigError, Operation, Rule, RuleTable};

fn op(pairs: &[(&str, &str)]) -> Operation {
    pairs.iter().copied().collect()
}

#[test]
fn last_appended_exact_rule_matches_its_own_operation() {
    // Self-match: after every append, probing the table with the new rule's
    // own labels resolves to that rule.
    let shapes: Vec<Vec<(&str, &str)>> = vec![
        vec![("method", "GET")],
        vec![("method", "POST"), ("path", "/upload")],
        vec![("method", "GET"), ("path", "/health"), ("internal", "yes")],
        vec![("tenant", "acme")],
    ];
    let mut table = RuleTable::new();
    for (i, pairs) in shapes.iter().enumerate() {
        let rule = Rule::new(pairs.clone()).with_credit_limit(i as u64 + 1);
        table.add_rule(rule).unwrap();
        let found = table.find_rule(&op(pairs)).unwrap();
        assert_eq!(found.credit_limit(), i as u64 + 1, "self-match for {:?}", pairs);
    }
}

#[test]
fn appending_a_masked_rule_fails() {
    let cases: Vec<(Vec<(&str, &str)>, Vec<(&str, &str)>)> = vec![
        // Exact behind wildcard.
        (vec![("a", "*")], vec![("a", "1")]),
        // Exact behind matching prefix.
        (vec![("a", "f*")], vec![("a", "foo")]),
        // Narrower prefix behind a broader one, no new constraints.
        (vec![("a", "f*")], vec![("a", "foo*")]),
        // Prefix behind wildcard.
        (vec![("ip", "*")], vec![("ip", "10.*")]),
        // Exact duplicate.
        (vec![("a", "1"), ("b", "2")], vec![("a", "1"), ("b", "2")]),
    ];
    for (first, second) in cases {
        let mut table = RuleTable::new();
        table.add_rule(Rule::new(first.clone())).unwrap();
        let err = table.add_rule(Rule::new(second.clone())).unwrap_err();
        assert!(
            matches!(err, ConfigError::UnreachableRule { .. }),
            "expected unreachable for {:?} after {:?}",
            second,
            first
        );
    }
}

#[test]
fn narrower_rules_with_extra_constraints_may_follow_broader_ones() {
    let mut table = RuleTable::new();
    table.add_rule(Rule::new([("a", "f*")])).unwrap();
    // Adds a constraint the earlier rule does not test; legitimate layering.
    table
        .add_rule(Rule::new([("a", "foo*"), ("b", "bar")]))
        .unwrap();
    assert_eq!(table.len(), 2);

    // At request time the broader rule still wins where both match.
    let governed = table.find_rule(&op(&[("a", "foobar"), ("b", "bar")])).unwrap();
    assert_eq!(governed.source(), "a=f*");
}

#[test]
fn default_section_first_does_not_mask_later_rules() {
    let table = config::parse_rules(
        "[default]\n\
         creditLimit = 10\n\
         resetSeconds = 60\n\
         \n\
         [method=GET path=/ping* ip=*]\n\
         creditLimit = 100\n\
         resetSeconds = 60\n\
         actorField = ip\n",
    )
    .unwrap();

    let ping = table
        .find_rule(&op(&[("method", "GET"), ("path", "/ping"), ("ip", "1.2.3.4")]))
        .unwrap();
    assert_eq!(ping.credit_limit(), 100);
    assert!(!ping.is_default());

    let fallback = table.find_rule(&op(&[("method", "DELETE")])).unwrap();
    assert!(fallback.is_default());
    assert_eq!(fallback.credit_limit(), 10);
}

#[test]
fn without_default_unmatched_operations_resolve_to_nothing() {
    let table = config::parse_rules("[method=GET]\ncreditLimit = 5\n").unwrap();
    assert!(table.find_rule(&op(&[("method", "POST")])).is_none());
    assert!(table.find_rule(&op(&[])).is_none());
}

#[test]
fn unreachable_rule_aborts_config_load_and_names_the_mask() {
    let err = config::parse_rules(
        "[path=/api*]\ncreditLimit = 5\n\n[path=/api/users]\ncreditLimit = 1\n",
    )
    .unwrap_err();
    match err {
        ConfigError::UnreachableRule { rule, masked_by } => {
            assert_eq!(rule, "path=/api/users");
            assert_eq!(masked_by, "path=/api*");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_operation_matches_only_the_default() {
    let table = config::parse_rules(
        "[method=GET]\ncreditLimit = 5\n\n[default]\ncreditLimit = 2\n",
    )
    .unwrap();
    let governed = table.find_rule(&op(&[])).unwrap();
    assert!(governed.is_default());
}

#[test]
fn matching_treats_missing_labels_as_empty() {
    let mut table = RuleTable::new();
    table.add_rule(Rule::new([("flag", "")])).unwrap();
    // Exact-empty matches a missing label.
    assert!(table.find_rule(&op(&[])).is_some());
    assert!(table.find_rule(&op(&[("flag", "set")])).is_none());
}
