use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tokio::time;
use tracing::{info, warn};

use crate::{
    agent::AgentUnderTest,
    config::EvalConfig,
    error::EvalError,
    eval::{
        driver::{DriveStatus, ScenarioDriver},
        judge::{Judge, JudgeClient, JudgeError},
        report::{RunAccumulator, RunReport, ScenarioRecord},
        scenario::{EvalMode, LoadedScenario, Scenario},
        step::grade_step,
        trajectory::grade_trajectory,
        verdict::{Failure, Verdict},
        GradingContext,
    },
    functions::FunctionRegistry,
};

/// Runs scenarios through a bounded pool and collects one record each.
pub struct EvalRunner {
    ctx: GradingContext,
    judge: JudgeClient,
}

impl EvalRunner {
    pub fn new(
        config: EvalConfig,
        judge: Arc<dyn Judge>,
        registry: &FunctionRegistry,
    ) -> Result<Self, EvalError> {
        config.validate()?;
        let judge = JudgeClient::new(judge, config.judge_timeout());
        let ctx = GradingContext::new(config, registry)
            .map_err(|error| EvalError::Config(format!("tool schemas: {error}")))?;
        Ok(Self { ctx, judge })
    }

    pub fn config(&self) -> &EvalConfig {
        &self.ctx.config
    }

    /// Checks the agent and the judge before anything is driven.
    pub async fn preflight(&self, agent: &dyn AgentUnderTest) -> Result<(), EvalError> {
        let timeout = self.ctx.config.agent_timeout();
        match time::timeout(timeout, agent.health_check()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                return Err(EvalError::Unreachable {
                    target: format!("agent {}", agent.name()),
                    message: error.to_string(),
                })
            }
            Err(_) => {
                return Err(EvalError::Unreachable {
                    target: format!("agent {}", agent.name()),
                    message: format!("health check timed out after {timeout:?}"),
                })
            }
        }

        self.judge
            .health_check()
            .await
            .map_err(|error| EvalError::Unreachable {
                target: format!("judge {}", self.judge.name()),
                message: match error {
                    JudgeError::Timeout(timeout) => {
                        format!("health check timed out after {timeout:?}")
                    }
                    other => other.to_string(),
                },
            })
    }

    /// Each ready scenario gets a fresh agent from `make_agent`.
    pub async fn run(
        &self,
        make_agent: impl Fn(&Scenario) -> Arc<dyn AgentUnderTest>,
        scenarios: Vec<LoadedScenario>,
    ) -> RunReport {
        let concurrency = self.ctx.config.concurrency.max(1);
        info!(scenarios = scenarios.len(), concurrency, "starting run");

        let make_agent = &make_agent;
        let mut records = stream::iter(scenarios)
            .map(|loaded| async move {
                match loaded {
                    LoadedScenario::Ready(scenario) => {
                        let verdict = self.run_scenario(make_agent(&scenario), &scenario).await;
                        ScenarioRecord {
                            scenario_id: scenario.id,
                            eval_mode: Some(scenario.eval_mode),
                            verdict,
                        }
                    }
                    LoadedScenario::Malformed {
                        id,
                        eval_mode,
                        error,
                    } => ScenarioRecord {
                        scenario_id: id,
                        eval_mode,
                        verdict: Verdict::malformed(error.to_string()),
                    },
                }
            })
            .buffer_unordered(concurrency);

        let mut accumulator = RunAccumulator::new();
        while let Some(record) = records.next().await {
            info!(
                scenario = %record.scenario_id,
                status = ?record.verdict.status(),
                passed = record.verdict.passed(),
                score = record.verdict.score(),
                "scenario finished"
            );
            accumulator.record(record);
        }

        let report = accumulator.finish();
        info!(
            total = report.summary.total,
            passed = report.summary.passed,
            pass_rate = report.summary.pass_rate,
            "run finished"
        );
        report
    }

    /// Drives and grades one scenario under the per-scenario timeout, if any.
    pub async fn run_scenario(&self, agent: Arc<dyn AgentUnderTest>, scenario: &Scenario) -> Verdict {
        match self.ctx.config.scenario_timeout() {
            Some(limit) => time::timeout(limit, self.evaluate(agent, scenario))
                .await
                .unwrap_or_else(|_| {
                    warn!(scenario = %scenario.id, ?limit, "scenario cancelled");
                    Verdict::cancelled(limit)
                }),
            None => self.evaluate(agent, scenario).await,
        }
    }

    async fn evaluate(&self, agent: Arc<dyn AgentUnderTest>, scenario: &Scenario) -> Verdict {
        let driver = ScenarioDriver::new(agent, self.ctx.config.agent_timeout());
        let outcome = driver.drive(scenario).await;

        if let DriveStatus::Errored { turn_index, error } = &outcome.status {
            return Verdict::errored(Failure::agent(
                "drive",
                format!("turn {turn_index}: {error}"),
            ));
        }

        match scenario.eval_mode {
            EvalMode::Step => {
                grade_step(
                    &outcome.transcript,
                    scenario.initial_state().stage,
                    &outcome.final_state,
                    &scenario.expected,
                    &self.judge,
                    &self.ctx,
                )
                .await
            }
            EvalMode::Trajectory => {
                grade_trajectory(
                    outcome.driven_turns(),
                    &outcome.final_state,
                    &scenario.expected,
                    &self.judge,
                    &self.ctx,
                )
                .await
            }
        }
    }
}
