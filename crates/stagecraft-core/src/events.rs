use crate::result::ValidationResult;
use serde::{Deserialize, Serialize};
use stagecraft_schema::MutationSpec;
use stagecraft_store::{PathResolver, StageRecord};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PreCreate,
    PostCreate,
    PreRequire,
    PostRequire,
    PreApply,
    PostApply,
    PreDestroy,
    PostDestroy,
    StatusCheck,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::PreCreate,
        EventKind::PostCreate,
        EventKind::PreRequire,
        EventKind::PostRequire,
        EventKind::PreApply,
        EventKind::PostApply,
        EventKind::PreDestroy,
        EventKind::PostDestroy,
        EventKind::StatusCheck,
    ];

    /// Whether an error result from this event aborts the transition.
    /// Post events and PreDestroy only log; StatusCheck only reports.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            EventKind::PreCreate | EventKind::PreRequire | EventKind::PreApply
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PreCreate => "pre_create",
            EventKind::PostCreate => "post_create",
            EventKind::PreRequire => "pre_require",
            EventKind::PostRequire => "post_require",
            EventKind::PreApply => "pre_apply",
            EventKind::PostApply => "post_apply",
            EventKind::PreDestroy => "pre_destroy",
            EventKind::PostDestroy => "post_destroy",
            EventKind::StatusCheck => "status_check",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient event handed to every listener of one dispatch.
///
/// `stage` is `None` only before a stage exists (PreCreate and status
/// checks run while the site is available).
#[derive(Debug, Clone)]
pub struct ValidationEvent {
    kind: EventKind,
    stage: Option<StageRecord>,
    paths: PathResolver,
    mutation: Option<MutationSpec>,
    results: Vec<ValidationResult>,
    propagation_stopped: bool,
}

impl ValidationEvent {
    pub fn new(kind: EventKind, paths: PathResolver, stage: Option<StageRecord>) -> Self {
        Self {
            kind,
            stage,
            paths,
            mutation: None,
            results: Vec::new(),
            propagation_stopped: false,
        }
    }

    #[must_use]
    pub fn with_mutation(mut self, mutation: MutationSpec) -> Self {
        self.mutation = Some(mutation);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn stage(&self) -> Option<&StageRecord> {
        self.stage.as_ref()
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn mutation(&self) -> Option<&MutationSpec> {
        self.mutation.as_ref()
    }

    /// The stage's copy of the lock file, when a stage exists.
    pub fn staged_lock_file(&self) -> Option<PathBuf> {
        self.stage
            .as_ref()
            .map(|s| s.staging_root.join(self.paths.lock_file_name()))
    }

    pub fn add_result(&mut self, result: ValidationResult) {
        self.results.push(result);
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.add_result(ValidationResult::error(message));
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.add_result(ValidationResult::warning(message));
    }

    /// Prevent lower-priority listeners from running for this dispatch.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(ValidationResult::is_error)
    }

    pub fn into_results(self) -> Vec<ValidationResult> {
        self.results
    }
}
