//! Action selection for the iteration controller.
//!
//! The controller owns the loop and the mode gating; a policy only proposes
//! the next action from a read-only view of the run.

use crate::config::ResearchMode;
use crate::research::planner::Angle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a search action should look for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "target", content = "angles")]
pub enum SearchTarget {
    /// Subquestions not searched yet.
    Subquestions,
    /// Wider phrasings of the query.
    Broaden,
    /// Add angle subquestions, then search everything not searched yet.
    Angles(Vec<Angle>),
}

/// Closed set of controller actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    Search { target: SearchTarget },
    Extract,
    Reason,
    Terminate,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Search { .. } => ActionKind::Search,
            Action::Extract => ActionKind::Extract,
            Action::Reason => ActionKind::Reason,
            Action::Terminate => ActionKind::Terminate,
        }
    }

    pub fn search(target: SearchTarget) -> Self {
        Action::Search { target }
    }
}

/// Discriminant of [`Action`], used in records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Search,
    Extract,
    Reason,
    Terminate,
}

impl ActionKind {
    /// Search and Extract gather information.
    pub fn is_work(self) -> bool {
        matches!(self, ActionKind::Search | ActionKind::Extract)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Search => write!(f, "search"),
            ActionKind::Extract => write!(f, "extract"),
            ActionKind::Reason => write!(f, "reason"),
            ActionKind::Terminate => write!(f, "terminate"),
        }
    }
}

/// Controller state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// The next action must be Reason in modes that require reasoning.
    Reasoning,
    /// A work action may run.
    Acting,
    Terminated,
}

impl RunPhase {
    /// Phase after `kind` completes in `mode`.
    ///
    /// In reasoning modes every work action hands control back to a
    /// reasoning step.
    pub fn after(self, mode: ResearchMode, kind: ActionKind) -> RunPhase {
        match kind {
            ActionKind::Terminate => RunPhase::Terminated,
            ActionKind::Reason => RunPhase::Acting,
            ActionKind::Search | ActionKind::Extract => {
                if mode.requires_reasoning() {
                    RunPhase::Reasoning
                } else {
                    RunPhase::Acting
                }
            }
        }
    }
}

/// Read-only view of a run handed to the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub mode: ResearchMode,
    pub phase: RunPhase,
    pub query: String,
    pub subquestions: Vec<String>,
    pub trivial: bool,
    pub actions_taken: usize,
    pub budget: usize,
    pub searches: usize,
    pub extractions: usize,
    pub reasoning_steps: usize,
    pub broadened: bool,
    pub unsearched_subquestions: usize,
    pub candidates: usize,
    pub pending_candidates: usize,
    pub documents: usize,
    pub min_documents: usize,
    pub angles_covered: Vec<Angle>,
    pub last_action: Option<ActionKind>,
}

impl RunState {
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.actions_taken)
    }

    pub fn sufficient(&self) -> bool {
        self.documents >= self.min_documents
    }

    pub fn angle_covered(&self, angle: Angle) -> bool {
        self.angles_covered.contains(&angle)
    }

    pub fn all_angles_covered(&self) -> bool {
        Angle::all().iter().all(|a| self.angle_covered(*a))
    }

    pub fn has_gathered(&self) -> bool {
        self.searches > 0 || self.extractions > 0
    }
}

/// Pluggable next-action selection.
#[async_trait]
pub trait ActionPolicy: Send + Sync {
    async fn choose_next_action(&self, state: &RunState) -> Action;
}

/// Deterministic per-mode policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModePolicy;

impl ModePolicy {
    pub fn new() -> Self {
        Self
    }

    fn speed(state: &RunState) -> Action {
        if state.extractions > 0 && state.sufficient() {
            Action::Terminate
        } else if state.searches == 0 {
            Action::search(SearchTarget::Subquestions)
        } else if state.pending_candidates > 0 {
            Action::Extract
        } else if !state.broadened {
            Action::search(SearchTarget::Broaden)
        } else {
            Action::Terminate
        }
    }

    fn balanced(state: &RunState) -> Action {
        if state.trivial {
            return if state.reasoning_steps == 0 {
                Action::Reason
            } else {
                Action::Terminate
            };
        }
        if state.extractions > 0 && state.sufficient() {
            return Action::Terminate;
        }
        if state.phase == RunPhase::Reasoning {
            return Action::Reason;
        }
        if state.searches == 0 {
            Action::search(SearchTarget::Subquestions)
        } else if state.pending_candidates > 0 {
            Action::Extract
        } else if !state.broadened {
            Action::search(SearchTarget::Broaden)
        } else {
            Action::Terminate
        }
    }

    fn quality(state: &RunState) -> Action {
        if state.phase == RunPhase::Reasoning || state.last_action.is_none_or(|k| k.is_work()) {
            return Action::Reason;
        }
        if !state.angle_covered(Angle::Definition) {
            Action::search(SearchTarget::Angles(vec![Angle::Definition]))
        } else if !state.angle_covered(Angle::Comparison) {
            Action::search(SearchTarget::Angles(vec![Angle::Comparison]))
        } else if !state.angle_covered(Angle::Recency) || !state.angle_covered(Angle::Critique) {
            let missing = [Angle::Recency, Angle::Critique]
                .into_iter()
                .filter(|a| !state.angle_covered(*a))
                .collect();
            Action::search(SearchTarget::Angles(missing))
        } else if state.extractions == 0 && state.pending_candidates > 0 {
            Action::Extract
        } else {
            Action::Terminate
        }
    }
}

#[async_trait]
impl ActionPolicy for ModePolicy {
    async fn choose_next_action(&self, state: &RunState) -> Action {
        match state.mode {
            ResearchMode::Speed => Self::speed(state),
            ResearchMode::Balanced => Self::balanced(state),
            ResearchMode::Quality => Self::quality(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(mode: ResearchMode) -> RunState {
        RunState {
            mode,
            phase: if mode.requires_reasoning() {
                RunPhase::Reasoning
            } else {
                RunPhase::Acting
            },
            query: "q".into(),
            subquestions: vec!["q".into()],
            trivial: false,
            actions_taken: 0,
            budget: 10,
            searches: 0,
            extractions: 0,
            reasoning_steps: 0,
            broadened: false,
            unsearched_subquestions: 1,
            candidates: 0,
            pending_candidates: 0,
            documents: 0,
            min_documents: 3,
            angles_covered: Vec::new(),
            last_action: None,
        }
    }

    #[test]
    fn test_phase_transitions() {
        use ActionKind::*;
        assert_eq!(RunPhase::Reasoning.after(ResearchMode::Quality, Reason), RunPhase::Acting);
        assert_eq!(RunPhase::Acting.after(ResearchMode::Quality, Search), RunPhase::Reasoning);
        assert_eq!(RunPhase::Acting.after(ResearchMode::Balanced, Search), RunPhase::Reasoning);
        assert_eq!(RunPhase::Acting.after(ResearchMode::Balanced, Extract), RunPhase::Reasoning);
        assert_eq!(RunPhase::Acting.after(ResearchMode::Speed, Extract), RunPhase::Acting);
        assert_eq!(RunPhase::Acting.after(ResearchMode::Speed, Terminate), RunPhase::Terminated);
    }

    #[tokio::test]
    async fn test_speed_policy_sequence() {
        let policy = ModePolicy::new();
        let mut s = state(ResearchMode::Speed);
        assert_eq!(
            policy.choose_next_action(&s).await,
            Action::search(SearchTarget::Subquestions)
        );
        s.searches = 1;
        s.pending_candidates = 4;
        assert_eq!(policy.choose_next_action(&s).await, Action::Extract);
        s.pending_candidates = 0;
        s.extractions = 1;
        s.documents = 1;
        assert_eq!(
            policy.choose_next_action(&s).await,
            Action::search(SearchTarget::Broaden)
        );
        s.documents = 3;
        assert_eq!(policy.choose_next_action(&s).await, Action::Terminate);
    }

    #[tokio::test]
    async fn test_balanced_trivial_query() {
        let policy = ModePolicy::new();
        let mut s = state(ResearchMode::Balanced);
        s.trivial = true;
        assert_eq!(policy.choose_next_action(&s).await, Action::Reason);
        s.reasoning_steps = 1;
        s.phase = RunPhase::Acting;
        assert_eq!(policy.choose_next_action(&s).await, Action::Terminate);
    }

    #[tokio::test]
    async fn test_balanced_round() {
        let policy = ModePolicy::new();
        let mut s = state(ResearchMode::Balanced);
        assert_eq!(policy.choose_next_action(&s).await, Action::Reason);
        s.phase = RunPhase::Acting;
        assert_eq!(
            policy.choose_next_action(&s).await,
            Action::search(SearchTarget::Subquestions)
        );
        s.searches = 1;
        s.pending_candidates = 2;
        s.phase = RunPhase::Acting.after(ResearchMode::Balanced, ActionKind::Search);
        assert_eq!(policy.choose_next_action(&s).await, Action::Reason);
        s.phase = RunPhase::Acting;
        assert_eq!(policy.choose_next_action(&s).await, Action::Extract);
        s.extractions = 1;
        s.pending_candidates = 0;
        s.documents = 5;
        s.phase = RunPhase::Reasoning;
        assert_eq!(policy.choose_next_action(&s).await, Action::Terminate);
    }

    #[tokio::test]
    async fn test_quality_walks_angles() {
        let policy = ModePolicy::new();
        let mut s = state(ResearchMode::Quality);
        assert_eq!(policy.choose_next_action(&s).await, Action::Reason);
        s.phase = RunPhase::Acting;
        s.last_action = Some(ActionKind::Reason);
        assert_eq!(
            policy.choose_next_action(&s).await,
            Action::search(SearchTarget::Angles(vec![Angle::Definition]))
        );
        s.angles_covered = vec![Angle::Definition, Angle::Comparison, Angle::Recency];
        assert_eq!(
            policy.choose_next_action(&s).await,
            Action::search(SearchTarget::Angles(vec![Angle::Critique]))
        );
        s.angles_covered.push(Angle::Critique);
        s.pending_candidates = 3;
        assert_eq!(policy.choose_next_action(&s).await, Action::Extract);
        s.pending_candidates = 0;
        assert_eq!(policy.choose_next_action(&s).await, Action::Terminate);
    }
}
