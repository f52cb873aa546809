use crate::drift::LockFileDriftDetector;
use crate::events::{EventKind, ValidationEvent};
use crate::lifecycle::validate_transition;
use crate::pipeline::{ListenerError, ValidationPipeline};
use crate::status::{CachedValidationRun, ValidationResultCache};
use crate::validators::register_builtin_validators;
use crate::CoreError;
use stagecraft_runtime::{FsExecutor, OperationExecutor};
use stagecraft_schema::{MutationSpec, OwnerToken, StageConfig, StageId};
use stagecraft_store::{
    FailureMarker, FailureMarkerRecord, FileKvStore, KeyValueStore, OwnershipLock, PathResolver,
    StageRecord, StageRecordStore, StageState,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A host's handle on the site's current stage.
///
/// Obtained from [`StageEngine::create`] or [`StageEngine::claim`]; every
/// transition re-reads the persisted record, so a stale handle can never
/// move the stage past what the store knows.
#[derive(Debug, Clone)]
pub struct Stage {
    record: StageRecord,
}

impl Stage {
    pub fn id(&self) -> &StageId {
        &self.record.stage_id
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.record.owner
    }

    pub fn state(&self) -> StageState {
        self.record.state
    }

    pub fn active_root(&self) -> &Path {
        &self.record.active_root
    }

    pub fn staging_root(&self) -> &Path {
        &self.record.staging_root
    }

    pub fn metadata(&self) -> &Metadata {
        &self.record.metadata
    }

    pub fn record(&self) -> &StageRecord {
        &self.record
    }
}

/// Staged-mutation lifecycle engine for one site.
///
/// Orchestrates `create → require → apply → destroy`, serialising hosts
/// through the [`OwnershipLock`], vetoing transitions through the
/// [`ValidationPipeline`], guarding the live codebase with the
/// [`LockFileDriftDetector`] and witnessing every apply with the
/// [`FailureMarker`]. The raw file work is delegated to an
/// [`OperationExecutor`].
pub struct StageEngine {
    config: StageConfig,
    paths: PathResolver,
    executor: Arc<dyn OperationExecutor>,
    pipeline: ValidationPipeline,
    lock: OwnershipLock,
    records: StageRecordStore,
    drift: LockFileDriftDetector,
    marker: FailureMarker,
    status: ValidationResultCache,
}

impl StageEngine {
    /// Build an engine from explicit collaborators.
    ///
    /// The configuration is validated and the state directory initialised.
    pub fn new(
        config: StageConfig,
        kv: Arc<dyn KeyValueStore>,
        executor: Arc<dyn OperationExecutor>,
        pipeline: ValidationPipeline,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let paths = PathResolver::new(&config);
        paths.initialize()?;
        let site = paths.site().clone();
        debug!(
            "engine for site {site} using {} executor, {} listeners",
            executor.name(),
            pipeline.len()
        );

        Ok(Self {
            lock: OwnershipLock::new(Arc::clone(&kv), &site),
            records: StageRecordStore::new(Arc::clone(&kv), &site),
            drift: LockFileDriftDetector::new(Arc::clone(&kv), &paths),
            marker: FailureMarker::new(paths.failure_marker_path()),
            status: ValidationResultCache::new(kv, &site, config.cache_ttl()),
            config,
            paths,
            executor,
            pipeline,
        })
    }

    /// The standard wiring: file-backed key/value store under the state
    /// directory, the filesystem executor, and the built-in validators.
    pub fn open(config: StageConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let paths = PathResolver::new(&config);
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::new(paths.kv_dir()));
        let executor: Arc<dyn OperationExecutor> =
            Arc::new(FsExecutor::new(config.executor.program.clone()));
        let mut pipeline = ValidationPipeline::new();
        register_builtin_validators(&mut pipeline, &config.validators);
        Self::new(config, kv, executor, pipeline)
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn pipeline(&self) -> &ValidationPipeline {
        &self.pipeline
    }

    pub fn failure_marker(&self) -> &FailureMarker {
        &self.marker
    }

    /// Register a listener. Changes the listener signature, so any cached
    /// status run stops being served.
    pub fn on_event<F>(&mut self, kind: EventKind, priority: i32, name: impl Into<String>, callback: F)
    where
        F: Fn(&mut ValidationEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.pipeline.on_event(kind, priority, name, callback);
    }

    /// The persisted stage of the site, if any, without ownership checks.
    pub fn current_stage(&self) -> Result<Option<StageRecord>, CoreError> {
        Ok(self.records.get()?)
    }

    pub fn create(&self, owner: &OwnerToken, metadata: Metadata) -> Result<Stage, CoreError> {
        info!("creating stage for {owner} in {}", self.paths.active_root().display());
        self.marker.assert_not_exists()?;

        let stage_id = StageId::generate(owner);
        self.lock.claim(&stage_id, owner, self.config.lock_ttl())?;
        self.reclaim_abandoned(&stage_id);

        let now = chrono::Utc::now().to_rfc3339();
        let mut record = StageRecord {
            stage_id: stage_id.clone(),
            owner: owner.clone(),
            state: StageState::Available,
            active_root: self.paths.active_root().to_path_buf(),
            staging_root: self.paths.stage_dir(&stage_id),
            metadata,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        };

        if let Err(e) = self.begin_stage(&mut record) {
            warn!("create of stage {stage_id} failed, rolling back: {e}");
            self.rollback_create(&record);
            return Err(e);
        }

        info!("stage {stage_id} created at {}", record.staging_root.display());
        self.dispatch(ValidationEvent::new(
            EventKind::PostCreate,
            self.paths.clone(),
            Some(record.clone()),
        ))?;
        Ok(Stage { record })
    }

    fn begin_stage(&self, record: &mut StageRecord) -> Result<(), CoreError> {
        self.dispatch(ValidationEvent::new(
            EventKind::PreCreate,
            self.paths.clone(),
            None,
        ))?;
        validate_transition(record.state, StageState::Created)?;
        // The baseline is the lock file the copy starts from.
        self.drift.record()?;
        self.executor.begin(
            &record.active_root,
            &record.staging_root,
            &self.paths.exclusions(),
        )?;
        self.drift.check()?;
        record.state = StageState::Created;
        self.records.put(record, Some(self.config.lock_ttl()))?;
        Ok(())
    }

    /// Remove the staging directories of stages whose claim lapsed without a
    /// destroy. Only the claim holder gets here, so every sibling of `keep`
    /// under the staging base is abandoned.
    fn reclaim_abandoned(&self, keep: &StageId) {
        let base = self.paths.staging_base();
        let entries = match std::fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot list staging base {}: {e}", base.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name() == keep.as_str() || !path.is_dir() {
                continue;
            }
            info!("reclaiming abandoned staging directory {}", path.display());
            if let Err(e) = self.executor.clean(&path) {
                warn!("failed to reclaim {}: {e}", path.display());
            }
        }
    }

    fn rollback_create(&self, record: &StageRecord) {
        if let Err(e) = self.executor.clean(&record.staging_root) {
            warn!("failed to clean staging after aborted create: {e}");
        }
        if let Err(e) = self.records.remove() {
            warn!("failed to remove stage record after aborted create: {e}");
        }
        if let Err(e) = self.drift.forget() {
            warn!("failed to forget lock file hash after aborted create: {e}");
        }
        if let Err(e) = self.lock.release(&record.stage_id) {
            warn!("failed to release claim after aborted create: {e}");
        }
    }

    /// Reattach to an existing stage owned by `owner`.
    pub fn claim(&self, stage_id: &StageId, owner: &OwnerToken) -> Result<Stage, CoreError> {
        info!("claiming stage {stage_id} for {owner}");
        self.marker.assert_not_exists()?;
        self.lock.verify(stage_id, owner)?;
        let record = self.load_record(stage_id)?;
        self.touch(&record)?;
        Ok(Stage { record })
    }

    pub fn require(&self, stage: &mut Stage, mutation: &MutationSpec) -> Result<(), CoreError> {
        info!("requiring {:?} in stage {}", mutation.package_names(), stage.id());
        let mut record = self.prepare(stage, StageState::Staged)?;
        self.drift.check()?;
        self.dispatch(
            ValidationEvent::new(EventKind::PreRequire, self.paths.clone(), Some(record.clone()))
                .with_mutation(mutation.clone()),
        )?;

        let timeout = self.config.operation_timeout();
        for command in mutation.to_commands() {
            let output = self
                .executor
                .stage_operation(&command, &record.staging_root, timeout)?;
            debug!(
                "{}: {}",
                command.join(" "),
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }

        self.advance(stage, &mut record, StageState::Staged)?;
        self.dispatch(
            ValidationEvent::new(EventKind::PostRequire, self.paths.clone(), Some(record))
                .with_mutation(mutation.clone()),
        )
    }

    pub fn apply(&self, stage: &mut Stage) -> Result<(), CoreError> {
        info!("applying stage {}", stage.id());
        let mut record = self.prepare(stage, StageState::Applying)?;
        self.drift.check()?;
        self.dispatch(ValidationEvent::new(
            EventKind::PreApply,
            self.paths.clone(),
            Some(record.clone()),
        ))?;

        // No stage is ever persisted as Applying without its marker.
        self.marker.write(&FailureMarkerRecord::new(
            &record.stage_id,
            format!(
                "apply of stage {} into {} did not complete",
                record.stage_id,
                record.active_root.display()
            ),
        ))?;
        if let Err(e) = self.advance(stage, &mut record, StageState::Applying) {
            warn!("stage {} could not enter applying: {e}", record.stage_id);
            if let Err(ce) = self.marker.clear() {
                warn!("failed to clear failure marker: {ce}");
            }
            return Err(e);
        }

        if let Err(e) = self.executor.commit(
            &record.staging_root,
            &record.active_root,
            &self.paths.exclusions(),
        ) {
            warn!("commit of stage {} failed: {e}", record.stage_id);
            match self
                .marker
                .annotate_cause(e.kind_name(), &e.to_string(), &error_chain(&e))
            {
                Ok(true) => {}
                Ok(false) => debug!("failure marker cause left unchanged"),
                Err(ae) => warn!("could not annotate failure marker: {ae}"),
            }
            return Err(CoreError::ApplyFailed {
                stage_id: record.stage_id.clone(),
                marker: self.marker.path().to_path_buf(),
                source: e,
            });
        }

        self.marker.clear()?;
        self.advance(stage, &mut record, StageState::Applied)?;
        info!("stage {} applied", record.stage_id);
        // The cached status describes the live tree as it was before.
        if let Err(e) = self.status.invalidate() {
            warn!("failed to invalidate cached status: {e}");
        }
        self.dispatch(ValidationEvent::new(
            EventKind::PostApply,
            self.paths.clone(),
            Some(record),
        ))
    }

    pub fn destroy(&self, stage: &mut Stage) -> Result<(), CoreError> {
        info!("destroying stage {}", stage.id());
        let record = self.prepare(stage, StageState::Destroyed)?;
        self.dispatch(ValidationEvent::new(
            EventKind::PreDestroy,
            self.paths.clone(),
            Some(record.clone()),
        ))?;

        self.executor.clean(&record.staging_root)?;
        self.drift.forget()?;
        self.records.remove()?;
        self.lock.release(&record.stage_id)?;

        stage.record = record;
        stage.record.state = StageState::Destroyed;
        stage.record.updated_at = chrono::Utc::now().to_rfc3339();
        info!("stage {} destroyed", stage.id());
        self.dispatch(ValidationEvent::new(
            EventKind::PostDestroy,
            self.paths.clone(),
            Some(stage.record.clone()),
        ))
    }

    /// Replace one metadata entry; `None` removes it.
    pub fn set_metadata(
        &self,
        stage: &mut Stage,
        key: &str,
        value: Option<serde_json::Value>,
    ) -> Result<(), CoreError> {
        self.marker.assert_not_exists()?;
        self.lock.verify(stage.id(), stage.owner())?;
        let mut record = self.load_record(stage.id())?;
        match value {
            Some(v) => record.metadata.insert(key.to_owned(), v),
            None => record.metadata.remove(key),
        };
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.touch(&record)?;
        stage.record = record;
        Ok(())
    }

    /// Run every StatusCheck listener now and cache the outcome.
    pub fn run_status_check(&self) -> Result<CachedValidationRun, CoreError> {
        self.status.run(&self.pipeline, self.status_event())
    }

    pub fn cached_status(&self) -> Result<Option<CachedValidationRun>, CoreError> {
        self.status.get_cached(&self.pipeline)
    }

    pub fn status_if_absent(&self) -> Result<CachedValidationRun, CoreError> {
        self.status
            .run_if_absent(&self.pipeline, || self.status_event())
    }

    fn status_event(&self) -> ValidationEvent {
        let stage = match self.records.get() {
            Ok(stage) => stage,
            Err(e) => {
                warn!("status check without stage record: {e}");
                None
            }
        };
        ValidationEvent::new(EventKind::StatusCheck, self.paths.clone(), stage)
    }

    /// Shared prologue of every transition on an existing stage: marker
    /// hard stop, ownership, then the state-machine check. Nothing is
    /// written before all three pass.
    fn prepare(&self, stage: &Stage, to: StageState) -> Result<StageRecord, CoreError> {
        self.marker.assert_not_exists()?;
        self.lock.verify(stage.id(), stage.owner())?;
        let record = self.load_record(stage.id())?;
        validate_transition(record.state, to)?;
        Ok(record)
    }

    fn advance(
        &self,
        stage: &mut Stage,
        record: &mut StageRecord,
        to: StageState,
    ) -> Result<(), CoreError> {
        validate_transition(record.state, to)?;
        record.state = to;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.touch(record)?;
        stage.record = record.clone();
        debug!("stage {} is now {to}", record.stage_id);
        Ok(())
    }

    /// Extend the claim and re-put the record under the same TTL, so the two
    /// always lapse together.
    fn touch(&self, record: &StageRecord) -> Result<(), CoreError> {
        self.lock
            .renew(&record.stage_id, &record.owner, self.config.lock_ttl())?;
        self.records.put(record, Some(self.config.lock_ttl()))?;
        Ok(())
    }

    fn load_record(&self, stage_id: &StageId) -> Result<StageRecord, CoreError> {
        match self.records.get()? {
            Some(record) if record.stage_id == *stage_id => Ok(record),
            _ => Err(CoreError::StageNotFound(stage_id.clone())),
        }
    }

    /// Run the listeners of `event`. Error results veto only the blocking
    /// events; everything else is logged and the transition carries on.
    fn dispatch(&self, mut event: ValidationEvent) -> Result<(), CoreError> {
        let kind = event.kind();
        self.pipeline.dispatch(&mut event);
        if kind.is_blocking() && event.has_errors() {
            info!("{kind} vetoed by validators");
            return Err(CoreError::StageValidation(event.into_results()));
        }
        for result in event.results() {
            warn!("{kind} listener reported {result}");
        }
        Ok(())
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}
