//! Shared evaluation path for local workers and cluster nodes.
//!
//! Evaluation is synchronous; workers run it on the blocking thread
//! pool. Panics inside a playbook (a misbehaving plugin, a bug in an
//! evaluator path) are caught at the join and reported as ordinary
//! failures so the worker survives.

use riposte_engine::{Evaluator, PlaybookSource, PluginInvoker, ScriptRunner};
use riposte_protocol::Job;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Everything a fresh evaluator needs, assembled once at startup.
pub struct EngineDeps {
    pub scripts: Box<dyn ScriptRunner>,
    pub plugins: Arc<dyn PluginInvoker>,
    pub library: Box<dyn PlaybookSource>,
}

impl EngineDeps {
    pub fn new(
        scripts: Box<dyn ScriptRunner>,
        plugins: Arc<dyn PluginInvoker>,
        library: Box<dyn PlaybookSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            plugins,
            library,
        })
    }
}

/// Evaluate one job's playbook on the current thread. Returns the
/// result list and final context, or the error string recorded on the
/// job.
pub fn evaluate(deps: &EngineDeps, job: &Job) -> Result<(Vec<Value>, Map<String, Value>), String> {
    let mut evaluator = Evaluator::new(
        job.context.clone(),
        &*deps.scripts,
        &*deps.plugins,
        &*deps.library,
    );
    match evaluator.run_playbook(&job.playbook) {
        Ok(results) => Ok((results, evaluator.into_context())),
        Err(e) => Err(e.to_string()),
    }
}

/// Evaluate on the blocking pool, converting panics into failures.
pub async fn evaluate_on_blocking_pool(
    deps: Arc<EngineDeps>,
    job: Job,
) -> Result<(Vec<Value>, Map<String, Value>), String> {
    let handle = tokio::task::spawn_blocking(move || evaluate(&deps, &job));
    match handle.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            if join_error.is_panic() {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(format!("panic during evaluation: {}", message))
            } else {
                Err("evaluation task cancelled".to_string())
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::deps_with_scripts;
    use super::*;
    use serde_json::json;

    fn job_with(playbook: Vec<Value>) -> Job {
        Job::new(playbook, Map::new())
    }

    #[tokio::test]
    async fn test_evaluation_returns_results_and_context() {
        let deps = deps_with_scripts(&[("hello", json!({"greeting": "world"}))]);
        let job = job_with(vec![json!({"run": "hello"})]);

        let (results, context) = evaluate_on_blocking_pool(deps, job).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(context.get("greeting"), Some(&json!("world")));
    }

    #[tokio::test]
    async fn test_panic_is_recovered_as_failure() {
        let deps = deps_with_scripts(&[]);
        let job = job_with(vec![json!({"run": "panic"})]);

        let error = evaluate_on_blocking_pool(deps, job).await.unwrap_err();
        assert!(error.contains("panic during evaluation"), "{error}");
        assert!(error.contains("scripted panic"), "{error}");
    }
}
