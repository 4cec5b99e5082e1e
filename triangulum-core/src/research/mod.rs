//! Research pipeline.
//!
//! A budgeted loop over a closed action set:
//! 1. **Plan**: Reformulate the query and decompose it into subquestions
//! 2. **Search**: Fan out over subquestions with domain-diversity caps
//! 3. **Extract**: Fetch pages and pull facts and quotes from each
//! 4. **Reason**: Ask the model what is established and what is missing
//! 5. **Terminate**: Aggregate evidence, cluster documents, synthesize the outline
//!
//! Credibility scoring and claim triangulation sit beside the loop and can be
//! used on their own.

pub mod clustering;
pub mod controller;
pub mod credibility;
pub mod events;
pub mod evidence;
pub mod expander;
pub mod extractor;
pub mod planner;
pub mod policy;
pub mod synthesis;
pub mod triangulation;

pub use clustering::{Cluster, DocumentClusterer};
pub use controller::{
    ActionFailure, ActionRecord, ResearchController, ResearchControllerBuilder, ResearchOutcome,
    ResearchRequest, ResearchRun,
};
pub use credibility::{
    CredibilityScorer, CredibilityTable, FileUnknownDomainLog, Lane, MemoryUnknownDomainLog,
    SourceCredibility, UnknownDomainSink,
};
pub use events::ResearchEvent;
pub use evidence::{EvidenceItem, EvidenceSource};
pub use expander::{SearchCandidate, SearchExpander};
pub use extractor::{
    ContentExtractor, ExtractedDocument, FactExtractor, HeuristicFactExtractor, ModelFactExtractor,
};
pub use planner::{Angle, QueryPlanner};
pub use policy::{Action, ActionKind, ActionPolicy, ModePolicy, RunPhase, RunState, SearchTarget};
pub use synthesis::{Outline, OutlineSection, OutlineSynthesizer};
pub use triangulation::{
    ClaimCluster, ClaimClusterKind, SourcedClaim, SupportingClaim, TriangulationGrouper,
    TriangulationReport,
};
