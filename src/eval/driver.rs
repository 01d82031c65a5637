use std::{sync::Arc, time::Duration};

use tokio::time;
use tracing::{debug, warn};

use crate::{
    agent::{AgentError, AgentUnderTest},
    eval::scenario::{EvalMode, Scenario},
    state::OnboardingState,
    transcript::Turn,
};

#[derive(Debug, Clone, PartialEq)]
pub enum DriveStatus {
    Completed,
    Errored { turn_index: usize, error: String },
}

#[derive(Debug, Clone)]
pub struct DriveOutcome {
    /// Injected history (step mode) followed by the driven turns.
    pub transcript: Vec<Turn>,
    pub final_state: OnboardingState,
    pub status: DriveStatus,
    driven_from: usize,
}

impl DriveOutcome {
    /// Turns produced by this drive, without injected history.
    pub fn driven_turns(&self) -> &[Turn] {
        &self.transcript[self.driven_from..]
    }

    pub fn is_completed(&self) -> bool {
        self.status == DriveStatus::Completed
    }
}

/// Replays a scenario's user turns against an agent, owning the running
/// state for the duration of one scenario.
pub struct ScenarioDriver {
    agent: Arc<dyn AgentUnderTest>,
    agent_timeout: Duration,
}

impl ScenarioDriver {
    pub fn new(agent: Arc<dyn AgentUnderTest>, agent_timeout: Duration) -> Self {
        Self {
            agent,
            agent_timeout,
        }
    }

    pub async fn drive(&self, scenario: &Scenario) -> DriveOutcome {
        let (mut transcript, mut state) = match scenario.eval_mode {
            EvalMode::Trajectory => (Vec::with_capacity(scenario.turns.len()), OnboardingState::new()),
            EvalMode::Step => (scenario.history.clone(), scenario.initial_state()),
        };
        let driven_from = transcript.len();

        for (turn_index, turn) in scenario.turns.iter().enumerate() {
            let reply = time::timeout(
                self.agent_timeout,
                self.agent.respond(&transcript, &state, &turn.user_message),
            )
            .await
            .unwrap_or_else(|_| Err(AgentError::Timeout(self.agent_timeout)));

            let reply = match reply {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(scenario = %scenario.id, turn_index, %error, "agent failed, stopping drive");
                    return DriveOutcome {
                        transcript,
                        final_state: state,
                        status: DriveStatus::Errored {
                            turn_index,
                            error: error.to_string(),
                        },
                        driven_from,
                    };
                }
            };

            debug!(
                scenario = %scenario.id,
                turn_index,
                from = %state.stage,
                to = %reply.state.stage,
                "turn driven"
            );
            transcript.push(Turn {
                user_message: turn.user_message.clone(),
                turn_notes: turn.turn_notes.clone(),
                agent_response: reply.response,
                tool_calls: reply.tool_calls,
                stage: Some(reply.state.stage),
            });
            state = reply.state;
        }

        DriveOutcome {
            transcript,
            final_state: state,
            status: DriveStatus::Completed,
            driven_from,
        }
    }
}
