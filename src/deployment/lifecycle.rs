use serde::{Deserialize, Serialize};
use statig::prelude::*;

use super::types::DeploymentStatus;

/// Phases a deployment moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Mapped,
    Analyzed,
    Generated,
    Tested,
    Gated,
    Committed,
    Pushed,
    PrOpened,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Mapped,
    Analyzed,
    Generated,
    Tested,
    Gated,
    Committed,
    Pushed,
    PrOpened,
    Finish(DeploymentStatus),
}

/// Context for the per-recommendation state machine. The machine only
/// accepts the next phase in order or a terminal status; anything else is
/// recorded in `rejected`.
#[derive(Debug, Default)]
pub struct DeploymentLifecycle {
    pub recommendation_id: String,
    phase: Option<Phase>,
    status: Option<DeploymentStatus>,
    rejected: Vec<String>,
}

impl DeploymentLifecycle {
    pub fn new(recommendation_id: impl Into<String>) -> Self {
        Self {
            recommendation_id: recommendation_id.into(),
            ..Default::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or(Phase::Pending)
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status.unwrap_or(DeploymentStatus::Pending)
    }

    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(
            recommendation.id = %self.recommendation_id,
            from = ?self.phase(),
            to = ?phase,
            "Deployment phase advanced"
        );
        self.phase = Some(phase);
    }

    fn finish(&mut self, status: DeploymentStatus) -> Outcome<State> {
        tracing::debug!(
            recommendation.id = %self.recommendation_id,
            phase = ?self.phase(),
            status = %status,
            "Deployment finished"
        );
        self.status = Some(status);
        self.phase = Some(Phase::Finished);
        Transition(State::finished())
    }

    fn reject(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        tracing::warn!(
            recommendation.id = %self.recommendation_id,
            phase = ?self.phase(),
            event = ?event,
            "Out-of-order deployment event ignored"
        );
        self.rejected.push(format!("{event:?} in {:?}", self.phase()));
        Handled
    }
}

#[state_machine(initial = "State::pending()")]
impl DeploymentLifecycle {
    #[state]
    fn pending(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Mapped => {
                self.enter(Phase::Mapped);
                Transition(State::mapped())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn mapped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Analyzed => {
                self.enter(Phase::Analyzed);
                Transition(State::analyzed())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn analyzed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Generated => {
                self.enter(Phase::Generated);
                Transition(State::generated())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn generated(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Tested => {
                self.enter(Phase::Tested);
                Transition(State::tested())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn tested(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Gated => {
                self.enter(Phase::Gated);
                Transition(State::gated())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn gated(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Committed => {
                self.enter(Phase::Committed);
                Transition(State::committed())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn committed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Pushed => {
                self.enter(Phase::Pushed);
                Transition(State::pushed())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn pushed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PrOpened => {
                self.enter(Phase::PrOpened);
                Transition(State::pr_opened())
            }
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    #[state]
    fn pr_opened(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Finish(status) => self.finish(*status),
            _ => self.reject(event),
        }
    }

    /// Terminal: every further event is ignored.
    #[state]
    fn finished(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        self.reject(event)
    }
}

/// Drives one [`DeploymentLifecycle`].
pub struct Lifecycle {
    machine: StateMachine<DeploymentLifecycle>,
}

impl Lifecycle {
    pub fn new(recommendation_id: impl Into<String>) -> Self {
        Self {
            machine: DeploymentLifecycle::new(recommendation_id).state_machine(),
        }
    }

    /// Feed `event`; returns whether the machine accepted it.
    pub fn advance(&mut self, event: LifecycleEvent) -> bool {
        let before = self.machine.inner().rejected().len();
        self.machine.handle(&event);
        self.machine.inner().rejected().len() == before
    }

    pub fn phase(&self) -> Phase {
        self.machine.inner().phase()
    }

    pub fn status(&self) -> DeploymentStatus {
        self.machine.inner().status()
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_pr_path() {
        let mut lifecycle = Lifecycle::new("r1");
        for event in [
            LifecycleEvent::Mapped,
            LifecycleEvent::Analyzed,
            LifecycleEvent::Generated,
            LifecycleEvent::Tested,
            LifecycleEvent::Gated,
            LifecycleEvent::Committed,
            LifecycleEvent::Pushed,
            LifecycleEvent::PrOpened,
        ] {
            assert!(lifecycle.advance(event));
        }
        assert_eq!(lifecycle.phase(), Phase::PrOpened);
        assert!(lifecycle.advance(LifecycleEvent::Finish(DeploymentStatus::Succeeded)));
        assert!(lifecycle.is_finished());
        assert_eq!(lifecycle.status(), DeploymentStatus::Succeeded);
    }

    #[test]
    fn test_phase_cannot_be_skipped() {
        let mut lifecycle = Lifecycle::new("r1");
        assert!(lifecycle.advance(LifecycleEvent::Mapped));
        assert!(!lifecycle.advance(LifecycleEvent::Committed));
        assert_eq!(lifecycle.phase(), Phase::Mapped);
    }

    #[test]
    fn test_failure_from_any_phase_is_terminal() {
        let mut lifecycle = Lifecycle::new("r1");
        lifecycle.advance(LifecycleEvent::Mapped);
        lifecycle.advance(LifecycleEvent::Analyzed);
        assert!(lifecycle.advance(LifecycleEvent::Finish(DeploymentStatus::FailedGeneration)));
        assert!(!lifecycle.advance(LifecycleEvent::Finish(DeploymentStatus::Succeeded)));
        assert!(!lifecycle.advance(LifecycleEvent::Generated));
        assert_eq!(lifecycle.status(), DeploymentStatus::FailedGeneration);
    }
}
