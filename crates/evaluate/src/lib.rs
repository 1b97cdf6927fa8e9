//! skala evaluate: turns gathered metrics into a replica-count decision.
//!
//! The evaluate program receives the stage's `EvaluateInfo` as JSON on
//! stdin and must print `{"targetReplicas": <n>}`. The post hook sees the
//! same info with the parsed evaluation attached.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use skala_core::{Config, EvaluateInfo, Evaluation, Method};
use skala_exec::Executer;

pub struct Evaluator {
    executer: Arc<dyn Executer>,
    config: Arc<Config>,
}

impl Evaluator {
    pub fn new(config: Arc<Config>, executer: Arc<dyn Executer>) -> Self {
        Self { executer, config }
    }

    pub async fn get_evaluation(&self, mut info: EvaluateInfo) -> Result<Evaluation> {
        let payload = serde_json::to_string(&info).context("marshalling evaluate info")?;
        self.run_hook(self.config.pre_evaluate.as_ref(), "pre-evaluate", &payload).await?;

        let method = self
            .config
            .evaluate
            .as_ref()
            .ok_or_else(|| anyhow!("no evaluate method configured"))?;
        let stdout = self
            .executer
            .execute_with_value(method, &payload)
            .await
            .context("failed to evaluate")?;
        let evaluation: Evaluation = serde_json::from_str(&stdout)
            .with_context(|| format!("failed to parse evaluation '{}'", stdout.trim_end()))?;
        debug!(target_replicas = evaluation.target_replicas, "evaluation parsed");

        if self.config.post_evaluate.is_some() {
            info.evaluation = Some(evaluation);
            let payload = serde_json::to_string(&info).context("marshalling evaluate info")?;
            self.run_hook(self.config.post_evaluate.as_ref(), "post-evaluate", &payload).await?;
        }
        Ok(evaluation)
    }

    async fn run_hook(&self, hook: Option<&Method>, stage: &str, payload: &str) -> Result<()> {
        if let Some(method) = hook {
            let output = self
                .executer
                .execute_with_value(method, payload)
                .await
                .with_context(|| format!("failed to run {stage} hook"))?;
            debug!(stage, output = %output, "hook finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skala_core::{ResourceMetric, RunType, Shell};
    use skala_exec::mock::MockExecuter;

    fn method(command: &str) -> Method {
        Method {
            typ: "shell".into(),
            timeout: None,
            shell: Some(Shell { entrypoint: "/bin/sh".into(), command: command.into() }),
        }
    }

    fn config() -> Config {
        Config { evaluate: Some(method("/evaluate.sh")), ..Config::default() }
    }

    fn info() -> EvaluateInfo {
        EvaluateInfo {
            metrics: vec![ResourceMetric { resource: "app".into(), value: "5".into() }],
            resource: json!({"metadata": {"name": "app"}}),
            run_type: RunType::Api,
            evaluation: None,
        }
    }

    #[tokio::test]
    async fn parses_the_evaluation_from_stdout() {
        let executer = Arc::new(MockExecuter::returning("{\"targetReplicas\":6}\n"));
        let ev = Evaluator::new(Arc::new(config()), executer.clone())
            .get_evaluation(info())
            .await
            .unwrap();
        assert_eq!(ev, Evaluation { target_replicas: 6 });
        // the program saw the metrics and run type
        let payload: serde_json::Value =
            serde_json::from_str(&executer.payloads()[0]).unwrap();
        assert_eq!(payload["metrics"][0]["value"], json!("5"));
        assert_eq!(payload["runType"], json!("api"));
    }

    #[tokio::test]
    async fn unparseable_stdout_is_a_stage_failure() {
        let executer = Arc::new(MockExecuter::returning("not json"));
        let err = Evaluator::new(Arc::new(config()), executer)
            .get_evaluation(info())
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("failed to parse evaluation 'not json'"), "got: {msg}");
    }

    #[tokio::test]
    async fn program_failure_is_wrapped() {
        let executer = Arc::new(MockExecuter::failing("exit status: 1"));
        let err = Evaluator::new(Arc::new(config()), executer)
            .get_evaluation(info())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to evaluate"));
    }

    #[tokio::test]
    async fn post_hook_sees_the_filled_evaluation() {
        let mut cfg = config();
        cfg.pre_evaluate = Some(method("/pre.sh"));
        cfg.post_evaluate = Some(method("/post.sh"));
        let executer = Arc::new(MockExecuter::new(Box::new(|m, _| {
            Ok(match m.shell.as_ref().map(|s| s.command.as_str()) {
                Some("/evaluate.sh") => "{\"targetReplicas\":2}".to_string(),
                _ => String::new(),
            })
        })));
        Evaluator::new(Arc::new(cfg), executer.clone()).get_evaluation(info()).await.unwrap();
        assert_eq!(
            executer.commands(),
            vec!["/pre.sh".to_string(), "/evaluate.sh".to_string(), "/post.sh".to_string()]
        );
        let post: serde_json::Value =
            serde_json::from_str(executer.payloads().last().unwrap()).unwrap();
        assert_eq!(post["evaluation"], json!({"targetReplicas": 2}));
    }

    #[tokio::test]
    async fn pre_hook_failure_stops_evaluation() {
        let mut cfg = config();
        cfg.pre_evaluate = Some(method("/pre.sh"));
        let executer = Arc::new(MockExecuter::failing("exit status: 1"));
        let err = Evaluator::new(Arc::new(cfg), executer.clone())
            .get_evaluation(info())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to run pre-evaluate hook"));
        assert_eq!(executer.commands(), vec!["/pre.sh".to_string()]);
    }
}
