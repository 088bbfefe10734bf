//! The rule evaluator.
//!
//! Interprets parsed [`Rule`] nodes strictly in order, mutating the
//! single context map in place so later rules observe the effects of
//! earlier ones. The first failing rule aborts the playbook with its
//! index attached.

use crate::context::{deep_merge, ContextStore, INCIDENT_UPDATES_KEY};
use crate::error::{EngineError, Result};
use crate::rule::{self, CmpOp, LogicMode, Rule, MAX_PLAY_DEPTH};
use crate::template;
use crate::traits::{PlaybookSource, PluginInvoker, ScriptRunner};
use serde_json::{json, Map, Value};
use tracing::debug;

/// What a single rule contributed to the result list.
enum Outcome {
    One(Value),
    /// `play` results are spliced one level into the caller's list.
    Many(Vec<Value>),
    Nothing,
}

/// Evaluates one job's playbook against one owned context.
pub struct Evaluator<'a> {
    ctx: ContextStore,
    scripts: &'a dyn ScriptRunner,
    plugins: &'a dyn PluginInvoker,
    library: &'a dyn PlaybookSource,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        context: Map<String, Value>,
        scripts: &'a dyn ScriptRunner,
        plugins: &'a dyn PluginInvoker,
        library: &'a dyn PlaybookSource,
    ) -> Self {
        Self {
            ctx: ContextStore::new(context),
            scripts,
            plugins,
            library,
            depth: 0,
        }
    }

    /// Parse and evaluate a raw playbook, returning the result list.
    pub fn run_playbook(&mut self, playbook: &[Value]) -> Result<Vec<Value>> {
        let rules = rule::parse_playbook(playbook)?;
        self.eval_rules(&rules)
    }

    /// The final context after evaluation.
    pub fn into_context(self) -> Map<String, Value> {
        self.ctx.into_inner()
    }

    pub fn context(&self) -> &Map<String, Value> {
        self.ctx.get()
    }

    fn eval_rules(&mut self, rules: &[Rule]) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            match self.eval_rule(rule).map_err(|e| e.at_rule(index))? {
                Outcome::One(value) => results.push(value),
                Outcome::Many(values) => results.extend(values),
                Outcome::Nothing => {}
            }
        }
        Ok(results)
    }

    fn eval_rule(&mut self, rule: &Rule) -> Result<Outcome> {
        match rule {
            Rule::Run { script, params } => self.eval_run(script, params).map(Outcome::One),
            Rule::Play { name } => self.eval_play(name).map(Outcome::Many),
            Rule::Plugin { name, params } => self.eval_plugin(name, params).map(Outcome::One),
            Rule::If {
                conditions,
                logic,
                then_branch,
                else_branch,
            } => self.eval_if(conditions, *logic, then_branch.as_deref(), else_branch.as_deref()),
            Rule::Var(path) => self.eval_var(path).map(Outcome::One),
            other => self.eval_expr(other).map(Outcome::One),
        }
    }

    /// Evaluate an operand expression to a plain value.
    fn eval_expr(&mut self, expr: &Rule) -> Result<Value> {
        match expr {
            Rule::Literal(value) => Ok(template::render(value, &self.ctx)),
            Rule::Var(path) => self.eval_var(path),
            Rule::Cmp { op, left, right } => {
                let left = self.eval_expr(left)?;
                let right = self.eval_expr(right)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Rule::AllOf(operands) => {
                for operand in operands {
                    let value = self.eval_expr(operand)?;
                    if !truthy(&value) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Rule::AnyOf(operands) => {
                for operand in operands {
                    let value = self.eval_expr(operand)?;
                    if truthy(&value) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Rule::Not(operand) => {
                let value = self.eval_expr(operand)?;
                Ok(Value::Bool(!truthy(&value)))
            }
            // Action nodes in expression position contribute their output value
            other => match self.eval_rule(other)? {
                Outcome::One(value) => Ok(value),
                Outcome::Many(values) => Ok(Value::Array(values)),
                Outcome::Nothing => Ok(Value::Null),
            },
        }
    }

    fn eval_run(&mut self, script: &str, params: &Map<String, Value>) -> Result<Value> {
        let payload = self.build_payload(params);
        debug!(script, "running automation");
        let mut result = self.scripts.run(script, &payload)?;

        // Scripts report incident changes out-of-band; fold them under
        // `incident` before the remaining keys deep-merge in.
        if let Some(updates) = result.remove(INCIDENT_UPDATES_KEY) {
            self.ctx.merge_incident(updates);
        }
        self.ctx.merge_result(result);

        Ok(json!({"script": script, "status": "completed"}))
    }

    fn eval_play(&mut self, name: &str) -> Result<Vec<Value>> {
        if self.depth >= MAX_PLAY_DEPTH {
            return Err(EngineError::validation(format!(
                "playbook nesting exceeds {} levels at '{}'",
                MAX_PLAY_DEPTH, name
            )));
        }
        let nodes = self.library.load(name)?;
        let rules = rule::parse_playbook(&nodes)?;
        debug!(playbook = name, rules = rules.len(), "entering nested playbook");

        self.depth += 1;
        let result = self.eval_rules(&rules);
        self.depth -= 1;
        result
    }

    fn eval_plugin(&mut self, name: &str, params: &Map<String, Value>) -> Result<Value> {
        let payload = self.build_payload(params);
        debug!(plugin = name, "executing plugin");
        let result = self.plugins.execute(name, &payload)?;

        if let Value::Object(fields) = &result {
            self.ctx.merge_result(fields.clone());
        }

        Ok(result)
    }

    fn eval_if(
        &mut self,
        conditions: &[Rule],
        logic: LogicMode,
        then_branch: Option<&Rule>,
        else_branch: Option<&Rule>,
    ) -> Result<Outcome> {
        let mut verdict = matches!(logic, LogicMode::And);
        for condition in conditions {
            let value = self.eval_expr(condition)?;
            let hit = truthy(&value);
            match logic {
                LogicMode::And if !hit => {
                    verdict = false;
                    break;
                }
                LogicMode::Or if hit => {
                    verdict = true;
                    break;
                }
                LogicMode::Or => verdict = false,
                LogicMode::And => {}
            }
        }

        let branch = if verdict { then_branch } else { else_branch };
        match branch {
            Some(rule) => self.eval_rule(rule),
            None => Ok(Outcome::Nothing),
        }
    }

    fn eval_var(&self, path: &str) -> Result<Value> {
        if path == "context" {
            return Ok(Value::Object(self.ctx.get().clone()));
        }
        // Flat lookup first: keys may legitimately contain dots
        if let Some(value) = self.ctx.get().get(path) {
            return Ok(value.clone());
        }
        self.ctx
            .resolve_path(path)
            .cloned()
            .ok_or_else(|| EngineError::PathNotFound(path.to_string()))
    }

    /// Template-substitute the params and deep-merge them atop a copy
    /// of the current context.
    fn build_payload(&self, params: &Map<String, Value>) -> Map<String, Value> {
        let rendered = match template::render(&Value::Object(params.clone()), &self.ctx) {
            Value::Object(map) => map,
            _ => unreachable!("rendering an object yields an object"),
        };
        let mut payload = self.ctx.get().clone();
        deep_merge(&mut payload, &rendered);
        payload
    }
}

/// DSL truthiness: null is false, booleans are themselves, strings and
/// collections are truthy when non-empty, numbers when non-zero.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Typed comparison. Numbers promote mutually to float for ordering,
/// strings compare lexicographically, and equality of complex values
/// is structural. Order operators on anything else are a type error.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                Some(a.cmp(&b))
            } else {
                let a = a.as_f64().ok_or_else(|| number_error(left))?;
                let b = b.as_f64().ok_or_else(|| number_error(right))?;
                a.partial_cmp(&b)
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    };

    match (op, ordering) {
        (CmpOp::Eq, Some(ord)) => Ok(ord == Ordering::Equal),
        (CmpOp::Ne, Some(ord)) => Ok(ord != Ordering::Equal),
        (CmpOp::Gt, Some(ord)) => Ok(ord == Ordering::Greater),
        (CmpOp::Lt, Some(ord)) => Ok(ord == Ordering::Less),
        (CmpOp::Ge, Some(ord)) => Ok(ord != Ordering::Less),
        (CmpOp::Le, Some(ord)) => Ok(ord != Ordering::Greater),
        // Structural equality covers mixed and complex operands
        (CmpOp::Eq, None) => Ok(left == right),
        (CmpOp::Ne, None) => Ok(left != right),
        (op, None) => Err(EngineError::TypeMismatch(format!(
            "cannot order {} against {} with '{}'",
            value_kind(left),
            value_kind(right),
            op.as_str()
        ))),
    }
}

fn number_error(value: &Value) -> EngineError {
    EngineError::TypeMismatch(format!("number {} is not comparable", value))
}

fn value_kind(value: &Value) -> &'static str {
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
    use crate::error::{PluginError, ScriptError};
    use crate::traits::EmptyPlaybookSource;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records invocations and replays canned results.
    #[derive(Default)]
    struct FakeRunner {
        results: HashMap<String, Map<String, Value>>,
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl FakeRunner {
        fn with(mut self, script: &str, result: Value) -> Self {
            let Value::Object(map) = result else {
                panic!("expected object result")
            };
            self.results.insert(script.to_string(), map);
            self
        }
    }

    impl ScriptRunner for FakeRunner {
        fn run(
            &self,
            script: &str,
            payload: &Map<String, Value>,
        ) -> std::result::Result<Map<String, Value>, ScriptError> {
            self.calls
                .lock()
                .unwrap()
                .push((script.to_string(), payload.clone()));
            self.results
                .get(script)
                .cloned()
                .ok_or_else(|| ScriptError::Failed {
                    script: script.to_string(),
                    message: "unknown script".to_string(),
                })
        }
    }

    #[derive(Default)]
    struct FakePlugins {
        results: HashMap<String, Value>,
    }

    impl FakePlugins {
        fn with(mut self, plugin: &str, result: Value) -> Self {
            self.results.insert(plugin.to_string(), result);
            self
        }
    }

    impl PluginInvoker for FakePlugins {
        fn execute(
            &self,
            plugin: &str,
            _params: &Map<String, Value>,
        ) -> std::result::Result<Value, PluginError> {
            self.results
                .get(plugin)
                .cloned()
                .ok_or_else(|| PluginError::NotFound(plugin.to_string()))
        }
    }

    struct MapSource(HashMap<String, Vec<Value>>);

    impl PlaybookSource for MapSource {
        fn load(&self, name: &str) -> Result<Vec<Value>> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::validation(format!("unknown playbook '{}'", name)))
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_basic_run_merges_result_into_context() {
        let runner = FakeRunner::default().with("hello", json!({"greeting": "world"}));
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let mut eval = Evaluator::new(Map::new(), &runner, &plugins, &library);
        let results = eval
            .run_playbook(&[json!({"run": "hello", "name": "world"})])
            .unwrap();

        assert_eq!(results, vec![json!({"script": "hello", "status": "completed"})]);
        assert_eq!(eval.context().get("greeting"), Some(&json!("world")));

        // The script saw its params merged atop the context
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1.get("name"), Some(&json!("world")));
    }

    #[test]
    fn test_run_result_deep_merges_nested_objects() {
        let runner =
            FakeRunner::default().with("enrich", json!({"lookup": {"cc": "US"}}));
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let context = obj(json!({"lookup": {"asn": 64500}}));
        let mut eval = Evaluator::new(context, &runner, &plugins, &library);
        eval.run_playbook(&[json!({"run": "enrich"})]).unwrap();

        // Existing nested keys survive the merge
        let lookup = eval.context().get("lookup").unwrap();
        assert_eq!(lookup["asn"], json!(64500));
        assert_eq!(lookup["cc"], json!("US"));
    }

    #[test]
    fn test_conditional_dispatches_to_nested_play() {
        let runner = FakeRunner::default().with("notify", json!({}));
        let plugins = FakePlugins::default();
        let library = MapSource(HashMap::from([(
            "escalate".to_string(),
            vec![json!({"run": "notify", "channel": "soc"})],
        )]));

        let context = obj(json!({"incident": {"threat_score": 75}}));
        let mut eval = Evaluator::new(context, &runner, &plugins, &library);
        let results = eval
            .run_playbook(&[json!({
                "if": {
                    "conditions": [[">=", {"var": "incident.threat_score"}, 50]],
                    "logic": "and",
                    "true": {"play": "escalate"}
                }
            })])
            .unwrap();

        // Nested play results are flattened into the caller's list
        assert_eq!(
            results,
            vec![json!({"script": "notify", "status": "completed"})]
        );
    }

    #[test]
    fn test_if_false_branch_missing_is_noop() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let context = obj(json!({"incident": {"threat_score": 10}}));
        let mut eval = Evaluator::new(context, &runner, &plugins, &library);
        let results = eval
            .run_playbook(&[json!({
                "if": {
                    "conditions": [[">=", {"var": "incident.threat_score"}, 50]],
                    "true": {"run": "never"}
                }
            })])
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_exact_match_template_hands_list_to_script() {
        let runner = FakeRunner::default().with("scan", json!({}));
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let context = obj(json!({"threat_intelligence": {"domains": ["a.com", "b.com"]}}));
        let mut eval = Evaluator::new(context, &runner, &plugins, &library);
        eval.run_playbook(&[json!({"run": "scan", "urls": "{{threat_intelligence.domains}}"})])
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1.get("urls"), Some(&json!(["a.com", "b.com"])));
    }

    #[test]
    fn test_plugin_incident_key_merges_second_level() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default().with(
            "enrich",
            json!({"incident": {"severity": "high"}, "lookup": {"asn": 64500}}),
        );
        let library = EmptyPlaybookSource;

        let context = obj(json!({"incident": {"id": "INC-1"}}));
        let mut eval = Evaluator::new(context, &runner, &plugins, &library);
        let results = eval.run_playbook(&[json!({"plugin": "enrich"})]).unwrap();

        assert_eq!(results.len(), 1);
        let ctx = eval.context();
        assert_eq!(ctx["incident"]["id"], json!("INC-1"));
        assert_eq!(ctx["incident"]["severity"], json!("high"));
        assert_eq!(ctx["lookup"]["asn"], json!(64500));
    }

    #[test]
    fn test_var_whole_context_and_dotted() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let context = obj(json!({"a": {"b": 7}}));
        let mut eval = Evaluator::new(context.clone(), &runner, &plugins, &library);

        let results = eval
            .run_playbook(&[json!({"var": "context"}), json!({"var": "a.b"})])
            .unwrap();
        assert_eq!(results[0], Value::Object(context));
        assert_eq!(results[1], json!(7));
    }

    #[test]
    fn test_var_missing_surfaces_path_not_found_with_index() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let mut eval = Evaluator::new(Map::new(), &runner, &plugins, &library);
        let err = eval.run_playbook(&[json!({"var": "nope"})]).unwrap_err();
        match err {
            EngineError::Rule { index, source } => {
                assert_eq!(index, 0);
                assert!(matches!(*source, EngineError::PathNotFound(_)));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_first_failure_aborts_playbook() {
        let runner = FakeRunner::default().with("ok", json!({"done": true}));
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let mut eval = Evaluator::new(Map::new(), &runner, &plugins, &library);
        let err = eval
            .run_playbook(&[
                json!({"run": "ok"}),
                json!({"run": "missing"}),
                json!({"run": "ok"}),
            ])
            .unwrap_err();
        match err {
            EngineError::Rule { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected: {other}"),
        }
        // Effects of the first rule persist
        assert_eq!(eval.context().get("done"), Some(&json!(true)));
    }

    #[test]
    fn test_later_rules_observe_earlier_mutations() {
        let runner = FakeRunner::default()
            .with("first", json!({"flag": true}))
            .with("second", json!({}));
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let mut eval = Evaluator::new(Map::new(), &runner, &plugins, &library);
        let results = eval
            .run_playbook(&[
                json!({"run": "first"}),
                json!({"if": [{"var": "flag"}, {"run": "second"}]}),
            ])
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_logic_short_circuit() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default();
        let library = EmptyPlaybookSource;

        let mut eval = Evaluator::new(obj(json!({"present": 1})), &runner, &plugins, &library);
        // The second operand would error (missing var) if evaluated
        let results = eval
            .run_playbook(&[json!({"or": [{"var": "present"}, {"var": "missing"}]})])
            .unwrap();
        assert_eq!(results, vec![json!(true)]);

        let results = eval
            .run_playbook(&[json!({"and": [false, {"var": "missing"}]})])
            .unwrap();
        assert_eq!(results, vec![json!(false)]);
    }

    #[test]
    fn test_play_recursion_bounded() {
        let runner = FakeRunner::default();
        let plugins = FakePlugins::default();
        let library = MapSource(HashMap::from([(
            "loop".to_string(),
            vec![json!({"play": "loop"})],
        )]));

        let mut eval = Evaluator::new(Map::new(), &runner, &plugins, &library);
        let err = eval.run_playbook(&[json!({"play": "loop"})]).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }

    mod truthiness {
        use super::*;

        #[test]
        fn test_spec_table() {
            assert!(!truthy(&json!(null)));
            assert!(truthy(&json!(true)));
            assert!(!truthy(&json!(false)));
            assert!(!truthy(&json!("")));
            assert!(truthy(&json!("x")));
            assert!(!truthy(&json!(0)));
            assert!(!truthy(&json!(0.0)));
            assert!(truthy(&json!(-1)));
            assert!(!truthy(&json!([])));
            assert!(truthy(&json!([0])));
            assert!(!truthy(&json!({})));
            assert!(truthy(&json!({"a": 1})));
        }
    }

    mod comparison {
        use super::*;

        #[test]
        fn test_numeric_promotion() {
            assert!(compare(CmpOp::Eq, &json!(1), &json!(1.0)).unwrap());
            assert!(compare(CmpOp::Gt, &json!(2.5), &json!(2)).unwrap());
            assert!(compare(CmpOp::Le, &json!(2), &json!(2)).unwrap());
        }

        #[test]
        fn test_strings_compare_as_strings() {
            assert!(compare(CmpOp::Lt, &json!("10"), &json!("9")).unwrap());
            assert!(compare(CmpOp::Eq, &json!("a"), &json!("a")).unwrap());
        }

        #[test]
        fn test_order_on_mixed_types_fails() {
            let err = compare(CmpOp::Gt, &json!("5"), &json!(4)).unwrap_err();
            assert!(matches!(err, EngineError::TypeMismatch(_)));

            let err = compare(CmpOp::Ge, &json!(true), &json!(false)).unwrap_err();
            assert!(matches!(err, EngineError::TypeMismatch(_)));
        }

        #[test]
        fn test_structural_equality_for_complex_values() {
            assert!(compare(CmpOp::Eq, &json!([1, 2]), &json!([1, 2])).unwrap());
            assert!(compare(CmpOp::Ne, &json!({"a": 1}), &json!({"a": 2})).unwrap());
            // Mixed types are simply unequal
            assert!(!compare(CmpOp::Eq, &json!("1"), &json!(1)).unwrap());
        }
    }
}
