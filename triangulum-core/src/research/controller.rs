//! Budgeted iteration controller.
//!
//! A [`ResearchRun`] is an explicit state machine over the closed
//! [`Action`] set. The [`ActionPolicy`] proposes actions; the run enforces
//! mode gating and the action budget, executes the action, and records
//! every failure instead of aborting. Only a missing capability fails a run,
//! and only before any work starts.

use crate::brain::ChatModel;
use crate::config::{ResearchConfig, ResearchMode};
use crate::embeddings::EmbeddingModel;
use crate::error::{ConfigError, ResearchError};
use crate::research::clustering::{Cluster, DocumentClusterer};
use crate::research::events::ResearchEvent;
use crate::research::evidence::{EvidenceItem, aggregate};
use crate::research::expander::{SearchCandidate, SearchExpander, SelectionState};
use crate::research::extractor::{
    ContentExtractor, ExtractedDocument, FactExtractor, ModelFactExtractor,
};
use crate::research::planner::{
    Angle, QueryPlanner, angle_query, broaden_queries, is_trivial_query,
};
use crate::research::policy::{
    Action, ActionKind, ActionPolicy, ModePolicy, RunPhase, RunState, SearchTarget,
};
use crate::research::synthesis::{Outline, OutlineSynthesizer};
use crate::types::Message;
use crate::web::{SearchBackend, WebFetcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;
const REASONING_EVIDENCE: usize = 5;

/// Input of a research run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub history: Vec<Message>,
    /// Falls back to the configured default mode.
    #[serde(default)]
    pub mode: Option<ResearchMode>,
    /// Capped by the mode's action budget.
    #[serde(default)]
    pub budget: Option<usize>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_mode(mut self, mode: ResearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// One executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub index: usize,
    pub kind: ActionKind,
    pub detail: String,
    /// Set when the controller replaced the policy's proposal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substituted_for: Option<ActionKind>,
}

/// A recovered failure inside an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ActionKind,
    /// Subquestion, URL or model involved.
    pub target: String,
    pub message: String,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub run_id: Uuid,
    pub outline: Outline,
    /// Query after reformulation.
    pub query: String,
    pub original_query: String,
    pub mode: ResearchMode,
    pub budget: usize,
    pub subquestions: Vec<String>,
    pub candidates: Vec<SearchCandidate>,
    pub documents: Vec<ExtractedDocument>,
    pub evidence: Vec<EvidenceItem>,
    pub clusters: Vec<Cluster>,
    pub actions: Vec<ActionRecord>,
    pub failures: Vec<ActionFailure>,
    pub reasoning_notes: Vec<String>,
    pub budget_exhausted: bool,
    pub cancelled: bool,
}

/// Builder for [`ResearchController`].
#[derive(Default)]
pub struct ResearchControllerBuilder {
    config: ResearchConfig,
    chat_model: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    search: Option<Arc<dyn SearchBackend>>,
    fetcher: Option<Arc<dyn WebFetcher>>,
    policy: Option<Arc<dyn ActionPolicy>>,
    fact_extractor: Option<Arc<dyn FactExtractor>>,
}

impl ResearchControllerBuilder {
    pub fn config(mut self, config: ResearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn chat_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.chat_model = Some(model);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingModel>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn search_backend(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(backend);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn WebFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the default [`ModePolicy`].
    pub fn policy(mut self, policy: Arc<dyn ActionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replace the default model-backed fact extractor.
    pub fn fact_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.fact_extractor = Some(extractor);
        self
    }

    /// Capabilities are validated when a run starts.
    pub fn build(self) -> ResearchController {
        ResearchController {
            config: Arc::new(self.config),
            chat_model: self.chat_model,
            embedder: self.embedder,
            search: self.search,
            fetcher: self.fetcher,
            policy: match self.policy {
                Some(policy) => policy,
                None => Arc::new(ModePolicy::new()),
            },
            fact_extractor: self.fact_extractor,
        }
    }
}

/// Top-level research orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct ResearchController {
    config: Arc<ResearchConfig>,
    chat_model: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    search: Option<Arc<dyn SearchBackend>>,
    fetcher: Option<Arc<dyn WebFetcher>>,
    policy: Arc<dyn ActionPolicy>,
    fact_extractor: Option<Arc<dyn FactExtractor>>,
}

fn missing(capability: &str) -> ResearchError {
    ConfigError::MissingCapability {
        capability: capability.to_string(),
    }
    .into()
}

impl ResearchController {
    pub fn builder() -> ResearchControllerBuilder {
        ResearchControllerBuilder::default()
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Run to completion and return the outline.
    pub async fn run(
        &self,
        query: &str,
        history: &[Message],
        mode: ResearchMode,
        budget: Option<usize>,
    ) -> Result<Outline, ResearchError> {
        let request = ResearchRequest {
            query: query.to_string(),
            history: history.to_vec(),
            mode: Some(mode),
            budget,
        };
        let outcome = self.run_detailed(request, CancellationToken::new()).await?;
        Ok(outcome.outline)
    }

    /// Run to completion and return everything the run produced.
    pub async fn run_detailed(
        &self,
        request: ResearchRequest,
        cancel: CancellationToken,
    ) -> Result<ResearchOutcome, ResearchError> {
        let run = self.start(request, cancel).await?;
        Ok(run.run_to_completion().await)
    }

    /// Validate capabilities, plan the query and return a run ready to step.
    pub async fn start(
        &self,
        request: ResearchRequest,
        cancel: CancellationToken,
    ) -> Result<ResearchRun, ResearchError> {
        self.start_with_events(request, cancel, None).await
    }

    /// Run in a background task, streaming progress events.
    ///
    /// Cancelling the returned token stops the run at its next suspension
    /// point; the stream still ends with exactly one terminal event.
    pub fn spawn_stream(
        &self,
        request: ResearchRequest,
    ) -> (ReceiverStream<ResearchEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let controller = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let terminal = match controller
                .start_with_events(request, token, Some(tx.clone()))
                .await
            {
                Ok(run) => ResearchEvent::Completed {
                    outcome: Box::new(run.run_to_completion().await),
                },
                Err(e) => ResearchEvent::Failed {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(terminal).await;
        });

        (ReceiverStream::new(rx), cancel)
    }

    async fn start_with_events(
        &self,
        request: ResearchRequest,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<ResearchEvent>>,
    ) -> Result<ResearchRun, ResearchError> {
        let chat_model = self.chat_model.clone().ok_or_else(|| missing("chat_model"))?;
        let embedder = self.embedder.clone().ok_or_else(|| missing("embedding_model"))?;
        let search = self.search.clone().ok_or_else(|| missing("search_backend"))?;
        let fetcher = self.fetcher.clone().ok_or_else(|| missing("web_fetcher"))?;

        let config = &self.config;
        let mode = request.mode.unwrap_or(config.mode);
        let cap = config.budgets.cap_for(mode).max(1);
        let budget = request.budget.unwrap_or(cap).min(cap).max(1);

        let facts: Arc<dyn FactExtractor> = match &self.fact_extractor {
            Some(extractor) => extractor.clone(),
            None => Arc::new(ModelFactExtractor::new(
                chat_model.clone(),
                config.extraction.max_facts,
                config.extraction.max_quotes,
            )),
        };

        let original_query = request.query.trim().to_string();
        let run_id = Uuid::new_v4();
        let mut run = ResearchRun {
            run_id,
            chat_model: chat_model.clone(),
            policy: self.policy.clone(),
            planner: QueryPlanner::new(chat_model, config.planner.clone()),
            expander: SearchExpander::new(search, config.search.clone()),
            extractor: ContentExtractor::new(fetcher, facts, config.extraction.clone()),
            clusterer: DocumentClusterer::new(embedder, config.clustering.clone()),
            synthesizer: OutlineSynthesizer::new(config.synthesis.clone()),
            cancel,
            events,
            original_query: original_query.clone(),
            state: RunState {
                mode,
                phase: if mode.requires_reasoning() {
                    RunPhase::Reasoning
                } else {
                    RunPhase::Acting
                },
                query: original_query.clone(),
                subquestions: Vec::new(),
                trivial: false,
                actions_taken: 0,
                budget,
                searches: 0,
                extractions: 0,
                reasoning_steps: 0,
                broadened: false,
                unsearched_subquestions: 0,
                candidates: 0,
                pending_candidates: 0,
                documents: 0,
                min_documents: config.sufficiency.min_documents,
                angles_covered: Vec::new(),
                last_action: None,
            },
            searched: HashSet::new(),
            selection: SelectionState::new(),
            candidates: Vec::new(),
            attempted: HashSet::new(),
            documents: Vec::new(),
            actions: Vec::new(),
            failures: Vec::new(),
            reasoning_notes: Vec::new(),
            budget_exhausted: false,
            outcome: None,
        };

        info!(%run_id, query = %original_query, mode = %mode, budget, "research run started");
        run.emit(ResearchEvent::Started {
            run_id,
            query: original_query,
            mode,
            budget,
        })
        .await;
        run.plan(&request.history).await;
        Ok(run)
    }
}

/// A single research run.
pub struct ResearchRun {
    run_id: Uuid,
    chat_model: Arc<dyn ChatModel>,
    policy: Arc<dyn ActionPolicy>,
    planner: QueryPlanner,
    expander: SearchExpander,
    extractor: ContentExtractor,
    clusterer: DocumentClusterer,
    synthesizer: OutlineSynthesizer,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<ResearchEvent>>,
    original_query: String,
    state: RunState,
    /// Lowercased queries already sent to the search backend.
    searched: HashSet<String>,
    selection: SelectionState,
    candidates: Vec<SearchCandidate>,
    attempted: HashSet<String>,
    documents: Vec<ExtractedDocument>,
    actions: Vec<ActionRecord>,
    failures: Vec<ActionFailure>,
    reasoning_notes: Vec<String>,
    budget_exhausted: bool,
    outcome: Option<ResearchOutcome>,
}

impl ResearchRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn phase(&self) -> RunPhase {
        self.state.phase
    }

    pub fn is_terminated(&self) -> bool {
        self.state.phase == RunPhase::Terminated
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn outcome(&self) -> Option<&ResearchOutcome> {
        self.outcome.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Step until the terminal action has run.
    pub async fn run_to_completion(mut self) -> ResearchOutcome {
        while !self.is_terminated() {
            self.step().await;
        }
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.terminate().await.clone(),
        }
    }

    /// Choose, gate and execute one action. Returns the phase afterwards.
    pub async fn step(&mut self) -> RunPhase {
        if self.is_terminated() {
            return self.state.phase;
        }
        if self.cancel.is_cancelled() {
            debug!("run cancelled, terminating");
            self.terminate().await;
            return self.state.phase;
        }

        self.refresh_state();
        let proposed = self.policy.choose_next_action(&self.state).await;
        let action = self.gate(proposed.clone());
        let substituted_for = (action.kind() != proposed.kind()).then(|| proposed.kind());
        if let Some(original) = substituted_for {
            debug!(proposed = %original, chosen = %action.kind(), "action substituted");
        }

        match action {
            Action::Terminate => {
                self.terminate_with(substituted_for).await;
            }
            action => self.execute(action, substituted_for).await,
        }
        self.state.phase
    }

    /// Run the terminal action. Calling it again returns the same outcome.
    pub async fn terminate(&mut self) -> &ResearchOutcome {
        self.terminate_with(None).await
    }

    async fn terminate_with(&mut self, substituted_for: Option<ActionKind>) -> &ResearchOutcome {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.finish(substituted_for).await,
        };
        self.outcome.insert(outcome)
    }

    async fn plan(&mut self, history: &[Message]) {
        let query = self
            .planner
            .reformulate(&self.original_query, history, &self.cancel)
            .await;
        let subquestions = self.planner.decompose(&query, &self.cancel).await;

        self.state.trivial = is_trivial_query(&query);
        self.state.query = query.clone();
        self.state.subquestions = subquestions.clone();
        self.refresh_state();

        debug!(query = %query, subquestions = subquestions.len(), "query planned");
        self.emit(ResearchEvent::Planned {
            query,
            subquestions,
        })
        .await;
    }

    fn refresh_state(&mut self) {
        self.state.actions_taken = self.actions.len();
        self.state.candidates = self.candidates.len();
        self.state.pending_candidates = self.pending_candidates().len();
        self.state.documents = self.documents.len();
        self.state.unsearched_subquestions = self.unsearched_subquestions().len();
    }

    fn pending_candidates(&self) -> Vec<SearchCandidate> {
        self.candidates
            .iter()
            .filter(|c| !self.attempted.contains(&c.url))
            .cloned()
            .collect()
    }

    fn unsearched_subquestions(&self) -> Vec<String> {
        self.state
            .subquestions
            .iter()
            .filter(|sq| !self.searched.contains(&sq.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Whether a search with `target` would send at least one query.
    fn has_search_work(&self, target: &SearchTarget) -> bool {
        match target {
            SearchTarget::Subquestions => self.state.unsearched_subquestions > 0,
            SearchTarget::Broaden => {
                !self.state.broadened
                    && broaden_queries(&self.state.query)
                        .iter()
                        .any(|q| !self.searched.contains(&q.to_lowercase()))
            }
            SearchTarget::Angles(angles) => {
                angles.iter().any(|a| !self.state.angle_covered(*a))
                    || self.state.unsearched_subquestions > 0
            }
        }
    }

    /// Enforce mode gating and the action budget on a proposed action.
    fn gate(&mut self, proposed: Action) -> Action {
        let state = &self.state;
        let mode = state.mode;
        let mut action = proposed;

        if action.kind().is_work()
            && mode.requires_reasoning()
            && state.phase == RunPhase::Reasoning
        {
            action = Action::Reason;
        }

        let invalid = match &action {
            Action::Extract => state.pending_candidates == 0,
            Action::Search { target } => !self.has_search_work(target),
            _ => false,
        };
        if invalid {
            action = Action::Reason;
        }

        if action == Action::Terminate && state.remaining() > 1 {
            if mode == ResearchMode::Quality && !state.all_angles_covered() {
                action = Action::Reason;
            } else if mode == ResearchMode::Balanced && !state.trivial && !state.has_gathered() {
                action = if state.phase == RunPhase::Acting {
                    Action::search(SearchTarget::Subquestions)
                } else {
                    Action::Reason
                };
            }
        }

        if state.remaining() <= 1 && action != Action::Terminate {
            debug!(budget = state.budget, "action budget exhausted");
            self.budget_exhausted = true;
            action = Action::Terminate;
        }
        action
    }

    async fn execute(&mut self, action: Action, substituted_for: Option<ActionKind>) {
        let index = self.actions.len();
        let kind = action.kind();
        self.emit(ResearchEvent::ActionStarted { index, kind }).await;
        debug!(index, action = %kind, "executing action");

        let detail = match action {
            Action::Search { target } => self.search(target).await,
            Action::Extract => self.extract().await,
            Action::Reason => self.reason().await,
            Action::Terminate => String::new(),
        };

        self.state.last_action = Some(kind);
        self.state.phase = self.state.phase.after(self.state.mode, kind);
        self.record(ActionRecord {
            index,
            kind,
            detail,
            substituted_for,
        })
        .await;
    }

    async fn record(&mut self, record: ActionRecord) {
        self.actions.push(record.clone());
        self.refresh_state();
        self.emit(ResearchEvent::ActionFinished { record }).await;
    }

    /// Resolve the queries for a search target, updating angle bookkeeping.
    fn take_search_queries(&mut self, target: SearchTarget) -> Vec<String> {
        match target {
            SearchTarget::Subquestions => self.unsearched_subquestions(),
            SearchTarget::Broaden => {
                self.state.broadened = true;
                broaden_queries(&self.state.query)
                    .into_iter()
                    .filter(|q| !self.searched.contains(&q.to_lowercase()))
                    .collect()
            }
            SearchTarget::Angles(angles) => {
                for angle in angles {
                    self.cover_angle(angle);
                }
                self.unsearched_subquestions()
            }
        }
    }

    fn cover_angle(&mut self, angle: Angle) {
        if self.state.angle_covered(angle) {
            return;
        }
        let query = angle_query(&self.state.query, angle);
        let exists = self
            .state
            .subquestions
            .iter()
            .any(|sq| sq.eq_ignore_ascii_case(&query));
        if !exists {
            self.state.subquestions.push(query);
        }
        self.state.angles_covered.push(angle);
    }

    async fn search(&mut self, target: SearchTarget) -> String {
        let queries = self.take_search_queries(target);
        let expansion = self
            .expander
            .expand_with(&queries, &mut self.selection, &self.cancel)
            .await;

        for query in &expansion.searched {
            self.searched.insert(query.to_lowercase());
        }
        for failure in &expansion.failures {
            self.failures.push(ActionFailure {
                kind: ActionKind::Search,
                target: failure.subquestion.clone(),
                message: failure.message.clone(),
            });
        }
        let added = expansion.candidates.len();
        self.candidates.extend(expansion.candidates);
        self.state.searches += 1;

        format!(
            "{} queries, {} new candidates, {} failures",
            expansion.searched.len(),
            added,
            expansion.failures.len()
        )
    }

    async fn extract(&mut self) -> String {
        let pending = self.pending_candidates();
        let batch = self
            .extractor
            .extract(&pending, &self.state.query, &self.cancel)
            .await;

        self.attempted.extend(batch.attempted.iter().cloned());
        for failure in &batch.failures {
            self.failures.push(ActionFailure {
                kind: ActionKind::Extract,
                target: failure.url.clone(),
                message: failure.message.clone(),
            });
        }
        let added = batch.documents.len();
        self.documents.extend(batch.documents);
        self.state.extractions += 1;

        format!(
            "{} attempted, {} documents, {} failures",
            batch.attempted.len(),
            added,
            batch.failures.len()
        )
    }

    async fn reason(&mut self) -> String {
        self.state.reasoning_steps += 1;
        let messages = self.reasoning_messages();
        match self.chat_model.invoke(&messages, &self.cancel).await {
            Ok(note) => {
                let note = note.trim().to_string();
                if note.is_empty() {
                    return "no note".to_string();
                }
                self.reasoning_notes.push(note);
                "note recorded".to_string()
            }
            Err(e) => {
                warn!(error = %e, "reasoning step failed");
                self.failures.push(ActionFailure {
                    kind: ActionKind::Reason,
                    target: self.chat_model.model_name().to_string(),
                    message: e.to_string(),
                });
                "reasoning failed".to_string()
            }
        }
    }

    fn reasoning_messages(&self) -> Vec<Message> {
        let evidence = aggregate(&self.documents);
        let top: Vec<String> = evidence
            .iter()
            .take(REASONING_EVIDENCE)
            .map(|e| format!("- {} ({} sources)", e.claim, e.sources.len()))
            .collect();
        let subquestions: Vec<String> = self
            .state
            .subquestions
            .iter()
            .map(|sq| format!("- {sq}"))
            .collect();
        vec![
            Message::system(
                "You are planning a research investigation. In two or three sentences, \
                 state what is already established and what is still missing.",
            ),
            Message::user(format!(
                "Question: {}\nSubquestions:\n{}\nDocuments read: {}\nLeading evidence:\n{}",
                self.state.query,
                subquestions.join("\n"),
                self.documents.len(),
                if top.is_empty() {
                    "- none yet".to_string()
                } else {
                    top.join("\n")
                }
            )),
        ]
    }

    async fn finish(&mut self, substituted_for: Option<ActionKind>) -> ResearchOutcome {
        let index = self.actions.len();
        self.emit(ResearchEvent::ActionStarted {
            index,
            kind: ActionKind::Terminate,
        })
        .await;

        let cancelled = self.cancel.is_cancelled();
        let evidence = aggregate(&self.documents);
        let clusters = if cancelled {
            Vec::new()
        } else {
            self.clusterer
                .cluster_auto(&self.documents, &self.state.subquestions)
                .await
        };
        let outline = self.synthesizer.synthesize(
            &self.state.query,
            &self.state.subquestions,
            &clusters,
            &evidence,
        );

        self.state.last_action = Some(ActionKind::Terminate);
        self.state.phase = RunPhase::Terminated;
        self.record(ActionRecord {
            index,
            kind: ActionKind::Terminate,
            detail: format!(
                "{} documents, {} evidence items, {} clusters",
                self.documents.len(),
                evidence.len(),
                clusters.len()
            ),
            substituted_for,
        })
        .await;

        info!(
            run_id = %self.run_id,
            actions = self.actions.len(),
            documents = self.documents.len(),
            failures = self.failures.len(),
            budget_exhausted = self.budget_exhausted,
            cancelled,
            "research run finished"
        );

        ResearchOutcome {
            run_id: self.run_id,
            outline,
            query: self.state.query.clone(),
            original_query: self.original_query.clone(),
            mode: self.state.mode,
            budget: self.state.budget,
            subquestions: self.state.subquestions.clone(),
            candidates: self.candidates.clone(),
            documents: self.documents.clone(),
            evidence,
            clusters,
            actions: self.actions.clone(),
            failures: self.failures.clone(),
            reasoning_notes: self.reasoning_notes.clone(),
            budget_exhausted: self.budget_exhausted,
            cancelled,
        }
    }

    async fn emit(&self, event: ResearchEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).await.is_err()
        {
            debug!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockChatModel;
    use crate::embeddings::LocalEmbedder;
    use crate::web::{InMemoryFetcher, InMemorySearchBackend, SearchHit};

    fn controller_with(
        search: InMemorySearchBackend,
        fetcher: InMemoryFetcher,
    ) -> ResearchController {
        ResearchController::builder()
            .chat_model(Arc::new(MockChatModel::with_response("Need more sources.")))
            .embedder(Arc::new(LocalEmbedder::new(64)))
            .search_backend(Arc::new(search))
            .fetcher(Arc::new(fetcher))
            .build()
    }

    fn corpus() -> (InMemorySearchBackend, InMemoryFetcher) {
        let mut hits = Vec::new();
        let mut fetcher = InMemoryFetcher::new();
        for (i, domain) in ["alpha.com", "beta.org", "gamma.net", "delta.io"].iter().enumerate() {
            let url = format!("https://{domain}/article{i}");
            hits.push(SearchHit::new(
                format!("Heat pumps report {i}"),
                &url,
                "heat pumps efficiency in cold climates",
            ));
            fetcher = fetcher.with_page(
                &url,
                Some(&format!("Report {i}")),
                format!(
                    "Heat pumps keep working efficiently in cold climates according to study {i}. \
                     Modern heat pumps reach a coefficient of performance above two at minus fifteen degrees."
                ),
            );
        }
        (InMemorySearchBackend::new().with_fallback(hits), fetcher)
    }

    #[tokio::test]
    async fn test_missing_capability_fails_before_work() {
        let controller = ResearchController::builder()
            .embedder(Arc::new(LocalEmbedder::default()))
            .build();
        let err = controller
            .run("heat pumps in cold climates", &[], ResearchMode::Balanced, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResearchError::Config(ConfigError::MissingCapability { ref capability })
                if capability == "chat_model"
        ));
    }

    #[tokio::test]
    async fn test_speed_run_terminates_when_sufficient() {
        let (search, fetcher) = corpus();
        let outcome = controller_with(search, fetcher)
            .run_detailed(
                ResearchRequest::new("heat pumps in cold climates").with_mode(ResearchMode::Speed),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let kinds: Vec<ActionKind> = outcome.actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Search, ActionKind::Extract, ActionKind::Terminate]
        );
        assert_eq!(outcome.documents.len(), 4);
        assert!(!outcome.budget_exhausted);
        assert!(!outcome.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_balanced_run_reasons_before_work() {
        let (search, fetcher) = corpus();
        let outcome = controller_with(search, fetcher)
            .run_detailed(
                ResearchRequest::new("heat pumps in cold climates"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let kinds: Vec<ActionKind> = outcome.actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Reason,
                ActionKind::Search,
                ActionKind::Reason,
                ActionKind::Extract,
                ActionKind::Terminate
            ]
        );
        assert_eq!(
            outcome.reasoning_notes,
            vec!["Need more sources.", "Need more sources."]
        );
    }

    #[tokio::test]
    async fn test_budget_one_only_terminates() {
        let (search, fetcher) = corpus();
        let outcome = controller_with(search, fetcher)
            .run_detailed(
                ResearchRequest::new("heat pumps in cold climates")
                    .with_mode(ResearchMode::Quality)
                    .with_budget(1),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].kind, ActionKind::Terminate);
        assert!(outcome.budget_exhausted);
        assert_eq!(outcome.budget, 1);
    }

    #[tokio::test]
    async fn test_requested_budget_is_capped_by_mode() {
        let (search, fetcher) = corpus();
        let run = controller_with(search, fetcher)
            .start(
                ResearchRequest::new("heat pumps in cold climates").with_budget(50),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.state().budget, 6);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (search, fetcher) = corpus();
        let mut run = controller_with(search, fetcher)
            .start(
                ResearchRequest::new("heat pumps in cold climates").with_mode(ResearchMode::Speed),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        run.step().await;
        run.step().await;
        let first = run.terminate().await.outline.clone();
        let actions = run.actions().len();
        let second = run.terminate().await.outline.clone();
        assert_eq!(first, second);
        assert_eq!(run.actions().len(), actions);
        assert_eq!(run.step().await, RunPhase::Terminated);
    }

    struct AlwaysExtract;

    #[async_trait::async_trait]
    impl ActionPolicy for AlwaysExtract {
        async fn choose_next_action(&self, _state: &RunState) -> Action {
            Action::Extract
        }
    }

    #[tokio::test]
    async fn test_gating_substitutes_invalid_actions() {
        let (search, fetcher) = corpus();
        let controller = ResearchController::builder()
            .chat_model(Arc::new(MockChatModel::new()))
            .embedder(Arc::new(LocalEmbedder::default()))
            .search_backend(Arc::new(search))
            .fetcher(Arc::new(fetcher))
            .policy(Arc::new(AlwaysExtract))
            .build();
        let outcome = controller
            .run_detailed(
                ResearchRequest::new("heat pumps in cold climates").with_mode(ResearchMode::Speed),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        // Nothing to extract: every proposal becomes Reason until the budget forces Terminate.
        assert_eq!(outcome.actions.len(), 5);
        assert!(outcome.actions[..4].iter().all(|a| {
            a.kind == ActionKind::Reason && a.substituted_for == Some(ActionKind::Extract)
        }));
        assert_eq!(outcome.actions[4].kind, ActionKind::Terminate);
        assert!(outcome.budget_exhausted);
    }
}
