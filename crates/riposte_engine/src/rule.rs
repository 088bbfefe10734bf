//! Rule nodes: the typed form of the playbook DSL.
//!
//! A playbook is an ordered array of JSON objects, each carrying
//! exactly one recognised operation key. Parsing builds the tagged
//! [`Rule`] variants once; evaluation is then a total match with no
//! stringly-typed dispatch.

use crate::error::{EngineError, Result};
use serde_json::{Map, Value};

/// Maximum nesting depth for `play` recursion.
pub const MAX_PLAY_DEPTH: usize = 16;

/// Comparison operators, including symbol synonyms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    /// Map an operation key (or array-form head) to an operator.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "eq" | "==" | "===" => Some(CmpOp::Eq),
            "!=" | "!==" => Some(CmpOp::Ne),
            "gt" | ">" => Some(CmpOp::Gt),
            "lt" | "<" => Some(CmpOp::Lt),
            "gte" | ">=" => Some(CmpOp::Ge),
            "lte" | "<=" => Some(CmpOp::Le),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "!=",
            CmpOp::Gt => "gt",
            CmpOp::Lt => "lt",
            CmpOp::Ge => "gte",
            CmpOp::Le => "lte",
        }
    }
}

/// How `if` conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicMode {
    #[default]
    And,
    Or,
}

/// A parsed rule node or operand expression.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Invoke an automation script; sibling keys are its parameters.
    Run {
        script: String,
        params: Map<String, Value>,
    },
    /// Evaluate a named playbook inline.
    Play { name: String },
    /// Invoke a plugin with optional parameters.
    Plugin {
        name: String,
        params: Map<String, Value>,
    },
    /// Conditional dispatch.
    If {
        conditions: Vec<Rule>,
        logic: LogicMode,
        then_branch: Option<Box<Rule>>,
        else_branch: Option<Box<Rule>>,
    },
    /// Context lookup by flat key or dotted path.
    Var(String),
    /// Typed comparison of two operand expressions.
    Cmp {
        op: CmpOp,
        left: Box<Rule>,
        right: Box<Rule>,
    },
    /// `and`/`or` over operand expressions, short-circuiting.
    AllOf(Vec<Rule>),
    AnyOf(Vec<Rule>),
    Not(Box<Rule>),
    /// Plain JSON operand (template-substituted at evaluation).
    Literal(Value),
}

const OPERATION_KEYS: &[&str] = &["run", "play", "plugin", "if", "var", "and", "or", "not"];

fn is_operation_key(key: &str) -> bool {
    OPERATION_KEYS.contains(&key) || CmpOp::from_key(key).is_some()
}

/// Parse a top-level playbook: every element must be a rule object.
pub fn parse_playbook(nodes: &[Value]) -> Result<Vec<Rule>> {
    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| parse_rule(node).map_err(|e| e.at_rule(index)))
        .collect()
}

/// Parse a node that must carry an operation key.
pub fn parse_rule(node: &Value) -> Result<Rule> {
    let Value::Object(map) = node else {
        return Err(EngineError::validation(format!(
            "rule node must be an object, got {}",
            type_name(node)
        )));
    };

    let op_keys: Vec<&String> = map.keys().filter(|k| is_operation_key(k)).collect();
    match op_keys.len() {
        0 => Err(EngineError::validation(
            "rule node carries no recognised operation key",
        )),
        1 => parse_operation(op_keys[0].as_str(), map),
        _ => Err(EngineError::validation(format!(
            "rule node carries multiple operation keys: {:?}",
            op_keys
        ))),
    }
}

/// Parse an operand expression: rule objects, array-form comparisons,
/// and plain literals are all accepted.
pub fn parse_expr(node: &Value) -> Result<Rule> {
    match node {
        Value::Object(map) => {
            if map.keys().any(|k| is_operation_key(k)) {
                parse_rule(node)
            } else {
                Ok(Rule::Literal(node.clone()))
            }
        }
        Value::Array(items) => {
            // Array form: [op, left, right]
            if let Some(Value::String(head)) = items.first() {
                if let Some(op) = CmpOp::from_key(head) {
                    if items.len() != 3 {
                        return Err(EngineError::validation(format!(
                            "comparison '{}' expects [op, left, right], got {} elements",
                            head,
                            items.len()
                        )));
                    }
                    return Ok(Rule::Cmp {
                        op,
                        left: Box::new(parse_expr(&items[1])?),
                        right: Box::new(parse_expr(&items[2])?),
                    });
                }
            }
            Ok(Rule::Literal(node.clone()))
        }
        other => Ok(Rule::Literal(other.clone())),
    }
}

fn parse_operation(key: &str, map: &Map<String, Value>) -> Result<Rule> {
    let value = &map[key];
    match key {
        "run" => {
            let script = expect_string(value, "run")?;
            let params = map
                .iter()
                .filter(|(k, _)| k.as_str() != "run")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(Rule::Run { script, params })
        }
        "play" => Ok(Rule::Play {
            name: expect_string(value, "play")?,
        }),
        "plugin" => parse_plugin(value),
        "if" => parse_if(value),
        "var" => Ok(Rule::Var(expect_string(value, "var")?)),
        "and" => Ok(Rule::AllOf(parse_expr_list(value, "and")?)),
        "or" => Ok(Rule::AnyOf(parse_expr_list(value, "or")?)),
        "not" => Ok(Rule::Not(Box::new(parse_expr(value)?))),
        other => {
            // Comparison key: value is [left, right]
            let op = CmpOp::from_key(other).ok_or_else(|| {
                EngineError::validation(format!("unknown operation key '{}'", other))
            })?;
            let Value::Array(operands) = value else {
                return Err(EngineError::validation(format!(
                    "comparison '{}' expects [left, right]",
                    other
                )));
            };
            if operands.len() != 2 {
                return Err(EngineError::validation(format!(
                    "comparison '{}' expects exactly two operands, got {}",
                    other,
                    operands.len()
                )));
            }
            Ok(Rule::Cmp {
                op,
                left: Box::new(parse_expr(&operands[0])?),
                right: Box::new(parse_expr(&operands[1])?),
            })
        }
    }
}

fn parse_plugin(value: &Value) -> Result<Rule> {
    match value {
        Value::String(name) => Ok(Rule::Plugin {
            name: name.clone(),
            params: Map::new(),
        }),
        Value::Object(spec) => {
            let name = spec
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::validation("plugin spec requires a 'name' string"))?
                .to_string();
            let params = match spec.get("params") {
                None => Map::new(),
                Some(Value::Object(params)) => params.clone(),
                Some(other) => {
                    return Err(EngineError::validation(format!(
                        "plugin params must be an object, got {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Rule::Plugin { name, params })
        }
        other => Err(EngineError::validation(format!(
            "plugin value must be a name or {{name, params}}, got {}",
            type_name(other)
        ))),
    }
}

fn parse_if(value: &Value) -> Result<Rule> {
    match value {
        // Array form: [cond, then, else?]
        Value::Array(items) => {
            if items.len() < 2 || items.len() > 3 {
                return Err(EngineError::validation(format!(
                    "if expects [condition, then, else?], got {} elements",
                    items.len()
                )));
            }
            Ok(Rule::If {
                conditions: vec![parse_expr(&items[0])?],
                logic: LogicMode::And,
                then_branch: Some(Box::new(parse_expr(&items[1])?)),
                else_branch: items.get(2).map(parse_expr).transpose()?.map(Box::new),
            })
        }
        // Object form: {conditions, logic, true, false}
        Value::Object(spec) => {
            let conditions = match spec.get("conditions") {
                Some(Value::Array(conds)) => {
                    conds.iter().map(parse_expr).collect::<Result<Vec<_>>>()?
                }
                Some(other) => {
                    return Err(EngineError::validation(format!(
                        "if conditions must be an array, got {}",
                        type_name(other)
                    )))
                }
                None => return Err(EngineError::validation("if object requires 'conditions'")),
            };
            let logic = match spec.get("logic").and_then(Value::as_str) {
                None | Some("and") => LogicMode::And,
                Some("or") => LogicMode::Or,
                Some(other) => {
                    return Err(EngineError::validation(format!(
                        "if logic must be 'and' or 'or', got '{}'",
                        other
                    )))
                }
            };
            Ok(Rule::If {
                conditions,
                logic,
                then_branch: spec.get("true").map(parse_expr).transpose()?.map(Box::new),
                else_branch: spec.get("false").map(parse_expr).transpose()?.map(Box::new),
            })
        }
        other => Err(EngineError::validation(format!(
            "if value must be an array or object, got {}",
            type_name(other)
        ))),
    }
}

fn parse_expr_list(value: &Value, op: &str) -> Result<Vec<Rule>> {
    let Value::Array(items) = value else {
        return Err(EngineError::validation(format!(
            "'{}' expects an array of nodes",
            op
        )));
    };
    items.iter().map(parse_expr).collect()
}

fn expect_string(value: &Value, key: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::validation(format!(
                "'{}' value must be a string, got {}",
                key,
                type_name(value)
            ))
        })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_run_collects_sibling_params() {
        let rule = parse_rule(&json!({"run": "hello", "name": "world", "count": 3})).unwrap();
        match rule {
            Rule::Run { script, params } => {
                assert_eq!(script, "hello");
                assert_eq!(params.get("name"), Some(&json!("world")));
                assert_eq!(params.get("count"), Some(&json!(3)));
                assert!(params.get("run").is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_plugin_string_and_object_forms() {
        assert!(matches!(
            parse_rule(&json!({"plugin": "geoip"})).unwrap(),
            Rule::Plugin { ref name, ref params } if name == "geoip" && params.is_empty()
        ));

        let rule =
            parse_rule(&json!({"plugin": {"name": "geoip", "params": {"ip": "1.2.3.4"}}})).unwrap();
        match rule {
            Rule::Plugin { name, params } => {
                assert_eq!(name, "geoip");
                assert_eq!(params.get("ip"), Some(&json!("1.2.3.4")));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_if_object_form() {
        let rule = parse_rule(&json!({
            "if": {
                "conditions": [[">=", {"var": "incident.threat_score"}, 50]],
                "logic": "and",
                "true": {"play": "escalate"}
            }
        }))
        .unwrap();
        match rule {
            Rule::If {
                conditions,
                logic,
                then_branch,
                else_branch,
            } => {
                assert_eq!(conditions.len(), 1);
                assert_eq!(logic, LogicMode::And);
                assert!(matches!(
                    then_branch.as_deref(),
                    Some(Rule::Play { name }) if name == "escalate"
                ));
                assert!(else_branch.is_none());
                assert!(matches!(conditions[0], Rule::Cmp { op: CmpOp::Ge, .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_if_array_form() {
        let rule = parse_rule(&json!({"if": [{"var": "x"}, {"run": "a"}, {"run": "b"}]})).unwrap();
        match rule {
            Rule::If {
                conditions,
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(conditions.len(), 1);
                assert!(then_branch.is_some());
                assert!(else_branch.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_comparison_synonyms() {
        for key in ["gte", ">="] {
            let rule = parse_rule(&json!({key: [1, 2]})).unwrap();
            assert!(matches!(rule, Rule::Cmp { op: CmpOp::Ge, .. }));
        }
        for key in ["==", "===", "eq"] {
            let rule = parse_rule(&json!({key: [1, 1]})).unwrap();
            assert!(matches!(rule, Rule::Cmp { op: CmpOp::Eq, .. }));
        }
    }

    #[test]
    fn test_parse_expr_array_form() {
        let rule = parse_expr(&json!([">", {"var": "a"}, 5])).unwrap();
        assert!(matches!(rule, Rule::Cmp { op: CmpOp::Gt, .. }));

        // Plain arrays stay literal
        let rule = parse_expr(&json!([1, 2, 3])).unwrap();
        assert!(matches!(rule, Rule::Literal(_)));
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let err = parse_rule(&json!({"frobnicate": true})).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn test_multiple_operation_keys_rejected() {
        let err = parse_rule(&json!({"run": "a", "play": "b"})).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn test_playbook_error_carries_rule_index() {
        let err = parse_playbook(&[json!({"run": "ok"}), json!({"bogus": 1})]).unwrap_err();
        match err {
            EngineError::Rule { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected: {other}"),
        }
    }
}
