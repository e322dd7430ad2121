//! Segment condition trees and their evaluator.
//!
//! A tree is either a combinator group (AND/OR over child nodes) or a
//! leaf rule `{field, operator, value}`. Evaluation is pure and fails
//! closed: an unknown field, an operator that does not apply to the
//! field's type, or a value that cannot be coerced all make the leaf
//! evaluate to `false`. A malformed rule must never block an otherwise
//! valid audience.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::ContactSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

/// Recursive condition tree. The two shapes are structurally disjoint,
/// so the serde representation stays untagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group {
        operator: Combinator,
        rules: Vec<ConditionNode>,
    },
    Rule {
        field: String,
        operator: String,
        #[serde(default)]
        value: Value,
    },
}

/// Declared type of a rule field; operators are scoped per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Number,
    /// Day-count fields ("days since...") compared with windowed operators.
    Days,
    Tags,
    Status,
    /// Derived engagement aggregates (opens/clicks) on the snapshot.
    Engagement,
}

fn field_kind(field: &str) -> Option<FieldKind> {
    match field {
        "email" | "phone" => Some(FieldKind::Text),
        "total_spent" | "total_orders" | "emails_sent" | "emails_opened" | "emails_clicked" => {
            Some(FieldKind::Number)
        }
        "days_since_last_order" => Some(FieldKind::Days),
        "tags" => Some(FieldKind::Tags),
        "status" => Some(FieldKind::Status),
        "engagement" => Some(FieldKind::Engagement),
        _ if field.starts_with("custom.") => Some(FieldKind::Text),
        _ => None,
    }
}

/// Evaluate a condition tree against one contact snapshot.
///
/// AND/OR short-circuit. An empty AND group is vacuously true, an empty
/// OR group is false.
pub fn evaluate(node: &ConditionNode, contact: &ContactSnapshot) -> bool {
    match node {
        ConditionNode::Group {
            operator: Combinator::And,
            rules,
        } => rules.iter().all(|r| evaluate(r, contact)),
        ConditionNode::Group {
            operator: Combinator::Or,
            rules,
        } => rules.iter().any(|r| evaluate(r, contact)),
        ConditionNode::Rule {
            field,
            operator,
            value,
        } => eval_rule(field, operator, value, contact).unwrap_or(false),
    }
}

/// Leaf evaluation. `None` means the rule is malformed for this field
/// and the caller treats it as a non-match.
fn eval_rule(field: &str, operator: &str, value: &Value, contact: &ContactSnapshot) -> Option<bool> {
    match field_kind(field)? {
        FieldKind::Text => {
            let actual = text_field(field, contact)?;
            let expected = coerce_text(value)?;
            eval_text(&actual, operator, &expected)
        }
        FieldKind::Number => {
            let actual = number_field(field, contact)?;
            eval_number(actual, operator, value)
        }
        FieldKind::Days => {
            // No order history: day-window rules never match.
            let days = contact.days_since_last_order?;
            let n = coerce_number(value)?;
            match operator {
                "within_days" => Some((days as f64) <= n),
                "not_within_days" => Some((days as f64) > n),
                "before_days" => Some((days as f64) < n),
                "after_days" => Some((days as f64) > n),
                _ => None,
            }
        }
        FieldKind::Tags => eval_tags(&contact.tags, operator, value),
        FieldKind::Status => {
            let expected = coerce_text(value)?;
            match operator {
                "equals" => Some(contact.status.as_str() == expected),
                "not_equals" => Some(contact.status.as_str() != expected),
                _ => None,
            }
        }
        FieldKind::Engagement => {
            let n = coerce_number(value)?;
            match operator {
                "opened_at_least" => Some(contact.emails_opened as f64 >= n),
                "clicked_at_least" => Some(contact.emails_clicked as f64 >= n),
                "open_rate_at_least" => {
                    let rate = if contact.emails_sent == 0 {
                        0.0
                    } else {
                        contact.emails_opened as f64 / contact.emails_sent as f64 * 100.0
                    };
                    Some(rate >= n)
                }
                _ => None,
            }
        }
    }
}

fn text_field(field: &str, contact: &ContactSnapshot) -> Option<String> {
    match field {
        "email" => contact.email.clone(),
        "phone" => contact.phone.clone(),
        _ => {
            let key = field.strip_prefix("custom.")?;
            match contact.custom.get(key)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        }
    }
}

fn number_field(field: &str, contact: &ContactSnapshot) -> Option<f64> {
    match field {
        "total_spent" => Some(contact.total_spent),
        "total_orders" => Some(contact.total_orders as f64),
        "emails_sent" => Some(contact.emails_sent as f64),
        "emails_opened" => Some(contact.emails_opened as f64),
        "emails_clicked" => Some(contact.emails_clicked as f64),
        _ => None,
    }
}

fn eval_text(actual: &str, operator: &str, expected: &str) -> Option<bool> {
    match operator {
        "equals" => Some(actual == expected),
        "not_equals" => Some(actual != expected),
        "contains" => Some(actual.contains(expected)),
        "not_contains" => Some(!actual.contains(expected)),
        "starts_with" => Some(actual.starts_with(expected)),
        "ends_with" => Some(actual.ends_with(expected)),
        _ => None,
    }
}

fn eval_number(actual: f64, operator: &str, value: &Value) -> Option<bool> {
    if operator == "between" {
        let bounds = value.as_array()?;
        if bounds.len() != 2 {
            return None;
        }
        let low = coerce_number(&bounds[0])?;
        let high = coerce_number(&bounds[1])?;
        return Some(actual >= low && actual <= high);
    }
    let expected = coerce_number(value)?;
    match operator {
        "equals" => Some(actual == expected),
        "not_equals" => Some(actual != expected),
        "greater_than" => Some(actual > expected),
        "greater_or_equal" => Some(actual >= expected),
        "less_than" => Some(actual < expected),
        "less_or_equal" => Some(actual <= expected),
        _ => None,
    }
}

fn eval_tags(tags: &[String], operator: &str, value: &Value) -> Option<bool> {
    match operator {
        "contains" => {
            let t = coerce_text(value)?;
            Some(tags.iter().any(|x| *x == t))
        }
        "not_contains" => {
            let t = coerce_text(value)?;
            Some(!tags.iter().any(|x| *x == t))
        }
        "contains_any" => {
            let wanted = coerce_text_list(value)?;
            Some(wanted.iter().any(|w| tags.iter().any(|x| x == w)))
        }
        "contains_all" => {
            let wanted = coerce_text_list(value)?;
            Some(wanted.iter().all(|w| tags.iter().any(|x| x == w)))
        }
        "length_equals" => {
            let n = coerce_number(value)?;
            Some(tags.len() as f64 == n)
        }
        "length_greater_than" => {
            let n = coerce_number(value)?;
            Some(tags.len() as f64 > n)
        }
        _ => None,
    }
}

/// Numbers arrive as JSON numbers or numeric strings; anything else is
/// a coercion failure (non-match).
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_text_list(value: &Value) -> Option<Vec<String>> {
    value.as_array()?.iter().map(coerce_text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(field: &str, operator: &str, value: Value) -> ConditionNode {
        ConditionNode::Rule {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }

    fn buyer() -> ContactSnapshot {
        let mut c = ContactSnapshot::new(1);
        c.email = Some("ada@example.com".into());
        c.tags = vec!["vip".into(), "newsletter".into()];
        c.total_spent = 1200.0;
        c.total_orders = 4;
        c.days_since_last_order = Some(12);
        c.emails_sent = 10;
        c.emails_opened = 6;
        c.emails_clicked = 2;
        c
    }

    #[test]
    fn and_group_is_conjunction_of_children() {
        let a = rule("total_spent", "greater_than", json!(1000));
        let b = rule("total_orders", "greater_than", json!(3));
        let both = ConditionNode::Group {
            operator: Combinator::And,
            rules: vec![a.clone(), b.clone()],
        };
        let c = buyer();
        assert_eq!(
            evaluate(&both, &c),
            evaluate(&a, &c) && evaluate(&b, &c)
        );
        assert!(evaluate(&both, &c));
    }

    #[test]
    fn high_spender_with_few_orders_is_excluded() {
        // spent > 1000 AND orders > 3
        let tree = ConditionNode::Group {
            operator: Combinator::And,
            rules: vec![
                rule("total_spent", "greater_than", json!(1000)),
                rule("total_orders", "greater_than", json!(3)),
            ],
        };
        let a = buyer();
        let mut b = buyer();
        b.total_orders = 2;
        assert!(evaluate(&tree, &a));
        assert!(!evaluate(&tree, &b));
    }

    #[test]
    fn or_group_matches_any_child() {
        let tree = ConditionNode::Group {
            operator: Combinator::Or,
            rules: vec![
                rule("total_spent", "greater_than", json!(99999)),
                rule("tags", "contains", json!("vip")),
            ],
        };
        assert!(evaluate(&tree, &buyer()));
    }

    #[test]
    fn empty_groups() {
        let c = buyer();
        let and = ConditionNode::Group {
            operator: Combinator::And,
            rules: vec![],
        };
        let or = ConditionNode::Group {
            operator: Combinator::Or,
            rules: vec![],
        };
        assert!(evaluate(&and, &c));
        assert!(!evaluate(&or, &c));
    }

    #[test]
    fn malformed_rules_fail_closed() {
        let c = buyer();
        // Unknown field.
        assert!(!evaluate(&rule("shoe_size", "equals", json!(42)), &c));
        // Operator from the wrong type family.
        assert!(!evaluate(&rule("total_spent", "starts_with", json!("12")), &c));
        // Uncoercible value.
        assert!(!evaluate(
            &rule("total_orders", "greater_than", json!("lots")),
            &c
        ));
        // Malformed between bounds.
        assert!(!evaluate(&rule("total_spent", "between", json!([1])), &c));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        assert!(evaluate(
            &rule("total_spent", "greater_than", json!("1000")),
            &buyer()
        ));
    }

    #[test]
    fn day_window_operators() {
        let c = buyer();
        assert!(evaluate(&rule("days_since_last_order", "within_days", json!(30)), &c));
        assert!(!evaluate(
            &rule("days_since_last_order", "not_within_days", json!(30)),
            &c
        ));

        let mut never = buyer();
        never.days_since_last_order = None;
        // No order history: day rules never match, in either direction.
        assert!(!evaluate(
            &rule("days_since_last_order", "within_days", json!(30)),
            &never
        ));
        assert!(!evaluate(
            &rule("days_since_last_order", "not_within_days", json!(30)),
            &never
        ));
    }

    #[test]
    fn tag_operators() {
        let c = buyer();
        assert!(evaluate(
            &rule("tags", "contains_any", json!(["vip", "wholesale"])),
            &c
        ));
        assert!(!evaluate(
            &rule("tags", "contains_all", json!(["vip", "wholesale"])),
            &c
        ));
        assert!(evaluate(&rule("tags", "length_equals", json!(2)), &c));
    }

    #[test]
    fn engagement_thresholds() {
        let c = buyer();
        assert!(evaluate(&rule("engagement", "opened_at_least", json!(5)), &c));
        assert!(evaluate(&rule("engagement", "open_rate_at_least", json!(50)), &c));
        assert!(!evaluate(
            &rule("engagement", "clicked_at_least", json!(3)),
            &c
        ));

        let mut fresh = ContactSnapshot::new(2);
        fresh.emails_sent = 0;
        // Zero sends: rate is 0, not a division error.
        assert!(!evaluate(
            &rule("engagement", "open_rate_at_least", json!(1)),
            &fresh
        ));
    }

    #[test]
    fn custom_fields_compare_as_text() {
        let mut c = buyer();
        c.custom.insert("city".into(), json!("Lisbon"));
        assert!(evaluate(&rule("custom.city", "equals", json!("Lisbon")), &c));
        assert!(!evaluate(&rule("custom.country", "equals", json!("PT")), &c));
    }

    #[test]
    fn trees_round_trip_through_json() {
        let raw = json!({
            "operator": "AND",
            "rules": [
                {"field": "total_spent", "operator": "greater_than", "value": 1000},
                {"operator": "OR", "rules": [
                    {"field": "tags", "operator": "contains", "value": "vip"},
                    {"field": "status", "operator": "equals", "value": "active"}
                ]}
            ]
        });
        let tree: ConditionNode = serde_json::from_value(raw).unwrap();
        assert!(evaluate(&tree, &buyer()));
    }
}
