//! Progress events streamed from a research run.

use crate::config::ResearchMode;
use crate::research::controller::{ActionRecord, ResearchOutcome};
use crate::research::policy::ActionKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One progress event. Every run ends with exactly one of
/// [`ResearchEvent::Completed`] or [`ResearchEvent::Failed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResearchEvent {
    Started {
        run_id: Uuid,
        query: String,
        mode: ResearchMode,
        budget: usize,
    },
    Planned {
        query: String,
        subquestions: Vec<String>,
    },
    ActionStarted {
        index: usize,
        kind: ActionKind,
    },
    ActionFinished {
        record: ActionRecord,
    },
    Completed {
        outcome: Box<ResearchOutcome>,
    },
    Failed {
        message: String,
    },
}

impl ResearchEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResearchEvent::Completed { .. } | ResearchEvent::Failed { .. }
        )
    }
}
