//! End-to-end lifecycle scenarios over a file-backed key/value store.
//!
//! Each test builds a throwaway site (active codebase, staging root and state
//! directory in one tempdir) and drives one or more `StageEngine`s against
//! it, the way separate requests of a host application would.

use stagecraft_core::{
    CoreError, EventKind, Metadata, StageEngine, ValidationEvent, ValidationPipeline,
    ValidationResult,
};
use stagecraft_runtime::{FsExecutor, MockExecutor, MockStep, OperationError, OperationExecutor};
use stagecraft_schema::{MutationSpec, OwnerToken, StageConfig};
use stagecraft_store::{FileKvStore, KeyValueStore, StageState};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

struct Site {
    dir: tempfile::TempDir,
    config: StageConfig,
    kv: Arc<dyn KeyValueStore>,
    mock: Arc<MockExecutor>,
}

impl Site {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::for_active_root(dir.path().join("app"));
        let active = &config.site.active_root;
        fs::create_dir_all(active.join("vendor/acme/widgets")).unwrap();
        fs::write(active.join("composer.json"), r#"{"require":{}}"#).unwrap();
        fs::write(active.join("composer.lock"), "lock v1\n").unwrap();
        fs::write(active.join("vendor/acme/widgets/Widget.php"), "<?php // 1.0").unwrap();
        let kv: Arc<dyn KeyValueStore> =
            Arc::new(FileKvStore::new(dir.path().join("state").join("kv")));
        Self {
            dir,
            config,
            kv,
            mock: Arc::new(MockExecutor::new()),
        }
    }

    /// A fresh engine sharing this site's store, as a new request would build it.
    fn engine(&self, pipeline: ValidationPipeline) -> StageEngine {
        StageEngine::new(
            self.config.clone(),
            Arc::clone(&self.kv),
            Arc::clone(&self.mock) as Arc<dyn OperationExecutor>,
            pipeline,
        )
        .unwrap()
    }

    fn active(&self) -> &Path {
        &self.config.site.active_root
    }
}

fn alice() -> OwnerToken {
    OwnerToken::new("alice@web1")
}

fn bob() -> OwnerToken {
    OwnerToken::new("bob@web2")
}

fn upgrade() -> MutationSpec {
    MutationSpec::new(&["acme/widgets:^2.0".to_owned()], &[]).unwrap()
}

#[test]
fn other_owner_blocked_until_destroy() {
    let site = Site::new();
    let a = site.engine(ValidationPipeline::new());
    let b = site.engine(ValidationPipeline::new());

    let mut s1 = a.create(&alice(), Metadata::new()).unwrap();
    assert!(matches!(
        b.claim(s1.id(), &bob()),
        Err(CoreError::NotOwner(_))
    ));
    assert!(matches!(
        b.create(&bob(), Metadata::new()),
        Err(CoreError::AlreadyClaimed { ref holder }) if holder == s1.id()
    ));

    a.destroy(&mut s1).unwrap();
    let s2 = b.create(&bob(), Metadata::new()).unwrap();
    assert_eq!(s2.owner(), &bob());
    assert_ne!(s2.id(), s1.id());
}

#[test]
fn expired_claim_frees_the_site() {
    let mut site = Site::new();
    site.config.lock.ttl_secs = 1;
    let a = site.engine(ValidationPipeline::new());
    let abandoned = a.create(&alice(), Metadata::new()).unwrap();
    assert!(abandoned.staging_root().exists());
    assert!(a.create(&bob(), Metadata::new()).is_err());

    thread::sleep(Duration::from_millis(1300));
    let taken_over = a.create(&bob(), Metadata::new()).unwrap();
    assert!(taken_over.staging_root().exists());
    assert!(!abandoned.staging_root().exists());
    let left: Vec<_> = fs::read_dir(a.paths().staging_base())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(left, vec![taken_over.staging_root().to_path_buf()]);
}

#[test]
fn reattach_keeps_the_record_alive_with_the_claim() {
    let mut site = Site::new();
    site.config.lock.ttl_secs = 2;
    let id = site
        .engine(ValidationPipeline::new())
        .create(&alice(), Metadata::new())
        .unwrap()
        .id()
        .clone();

    thread::sleep(Duration::from_millis(1300));
    let later = site.engine(ValidationPipeline::new());
    let mut stage = later.claim(&id, &alice()).unwrap();

    // Past the record's original expiry, inside the renewed claim.
    thread::sleep(Duration::from_millis(1000));
    assert_eq!(later.current_stage().unwrap().unwrap().stage_id, id);
    later.destroy(&mut stage).unwrap();
    assert!(!stage.staging_root().exists());
    later.create(&bob(), Metadata::new()).unwrap();
}

#[test]
fn reattach_in_a_later_request() {
    let site = Site::new();
    let id = {
        let first = site.engine(ValidationPipeline::new());
        let mut meta = Metadata::new();
        meta.insert("reason".to_owned(), serde_json::json!("security release"));
        first.create(&alice(), meta).unwrap().id().clone()
    };

    let second = site.engine(ValidationPipeline::new());
    let mut stage = second.claim(&id, &alice()).unwrap();
    assert_eq!(stage.state(), StageState::Created);
    assert_eq!(stage.metadata()["reason"], "security release");
    second.require(&mut stage, &upgrade()).unwrap();

    let third = site.engine(ValidationPipeline::new());
    let mut stage = third.claim(&id, &alice()).unwrap();
    assert_eq!(stage.state(), StageState::Staged);
    third.apply(&mut stage).unwrap();
    third.destroy(&mut stage).unwrap();
}

#[test]
fn pre_apply_error_keeps_stage_staged() {
    let site = Site::new();
    let mut pipeline = ValidationPipeline::new();
    pipeline.on_event(EventKind::PreApply, 10, "freeze", |e: &mut ValidationEvent| {
        e.add_error("deploy freeze in effect");
        Ok(())
    });
    let engine = site.engine(pipeline);

    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();
    let err = engine.apply(&mut stage).unwrap_err();
    match err {
        CoreError::StageValidation(results) => {
            assert_eq!(results, vec![ValidationResult::error("deploy freeze in effect")]);
        }
        other => panic!("expected StageValidation, got {other}"),
    }
    assert_eq!(stage.state(), StageState::Staged);
    assert_eq!(
        engine.current_stage().unwrap().unwrap().state,
        StageState::Staged
    );
    assert_eq!(site.mock.count(MockStep::Commit), 0);
    assert!(!engine.failure_marker().exists());
}

#[test]
fn drift_between_create_and_require() {
    let site = Site::new();
    let engine = site.engine(ValidationPipeline::new());
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();

    fs::write(site.active().join("composer.lock"), "lock v1 + hotfix\n").unwrap();
    assert!(matches!(
        engine.require(&mut stage, &upgrade()),
        Err(CoreError::DriftDetected { .. })
    ));
    assert_eq!(site.mock.count(MockStep::StageOperation), 0);
    assert_eq!(stage.state(), StageState::Created);
}

#[test]
fn drift_between_require_and_apply() {
    let site = Site::new();
    let engine = site.engine(ValidationPipeline::new());
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();

    fs::remove_file(site.active().join("composer.lock")).unwrap();
    assert!(matches!(
        engine.apply(&mut stage),
        Err(CoreError::DriftDetected { .. })
    ));
    assert!(!engine.failure_marker().exists());
}

/// Lands a hotfix in the live lock file while the copy is running.
struct HotfixDuringCopy {
    inner: MockExecutor,
}

impl OperationExecutor for HotfixDuringCopy {
    fn name(&self) -> &str {
        "hotfix-during-copy"
    }

    fn begin(
        &self,
        active_root: &Path,
        staging_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        self.inner.begin(active_root, staging_root, exclusions)?;
        fs::write(active_root.join("composer.lock"), "lock v1\nsecurity hotfix\n")?;
        Ok(())
    }

    fn stage_operation(
        &self,
        command: &[String],
        staging_root: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, OperationError> {
        self.inner.stage_operation(command, staging_root, timeout)
    }

    fn commit(
        &self,
        staging_root: &Path,
        active_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError> {
        self.inner.commit(staging_root, active_root, exclusions)
    }

    fn clean(&self, staging_root: &Path) -> Result<(), OperationError> {
        self.inner.clean(staging_root)
    }
}

#[test]
fn lock_file_change_during_copy_fails_create() {
    let site = Site::new();
    let engine = StageEngine::new(
        site.config.clone(),
        Arc::clone(&site.kv),
        Arc::new(HotfixDuringCopy {
            inner: MockExecutor::new(),
        }),
        ValidationPipeline::new(),
    )
    .unwrap();

    let err = engine.create(&alice(), Metadata::new()).unwrap_err();
    assert!(matches!(err, CoreError::DriftDetected { .. }), "got {err}");
    assert!(engine.current_stage().unwrap().is_none());
    assert_eq!(
        fs::read_dir(engine.paths().staging_base()).unwrap().count(),
        0
    );

    // The next create starts from the hotfixed lock file and carries it through.
    let normal = site.engine(ValidationPipeline::new());
    let mut stage = normal.create(&alice(), Metadata::new()).unwrap();
    normal.require(&mut stage, &upgrade()).unwrap();
    normal.apply(&mut stage).unwrap();
    let live = fs::read_to_string(site.active().join("composer.lock")).unwrap();
    assert!(live.starts_with("lock v1\nsecurity hotfix\n"));
    assert!(live.contains("acme/widgets"));
}

#[test]
fn failed_commit_leaves_marker_until_cleared() {
    let site = Site::new();
    let engine = site.engine(ValidationPipeline::new());
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();

    site.mock.fail_on(MockStep::Commit, "no space left on device");
    let err = engine.apply(&mut stage).unwrap_err();
    assert!(matches!(err, CoreError::ApplyFailed { .. }));

    let record = engine.failure_marker().read().unwrap().unwrap();
    assert_eq!(&record.stage_id, stage.id());
    assert_eq!(record.cause_class.as_deref(), Some("injected"));
    assert!(record
        .cause_message
        .as_deref()
        .unwrap()
        .contains("no space left"));
    assert_eq!(
        engine.current_stage().unwrap().unwrap().state,
        StageState::Applying
    );

    // Every lifecycle call is now a hard stop, for every engine.
    let other = site.engine(ValidationPipeline::new());
    assert!(matches!(
        other.create(&bob(), Metadata::new()),
        Err(CoreError::FailureMarkerExists { .. })
    ));
    assert!(matches!(
        engine.apply(&mut stage),
        Err(CoreError::FailureMarkerExists { .. })
    ));
    assert!(matches!(
        engine.destroy(&mut stage),
        Err(CoreError::FailureMarkerExists { .. })
    ));
    assert!(matches!(
        engine.claim(stage.id(), &alice()),
        Err(CoreError::FailureMarkerExists { .. })
    ));

    engine.failure_marker().clear().unwrap();
    site.mock.clear_failures();
    engine.destroy(&mut stage).unwrap();
    other.create(&bob(), Metadata::new()).unwrap();
}

#[test]
fn timeout_during_apply_leaves_marker() {
    let site = Site::new();
    let engine = site.engine(ValidationPipeline::new());
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();

    site.mock.timeout_on(MockStep::Commit);
    assert!(engine.apply(&mut stage).is_err());
    let record = engine.failure_marker().read().unwrap().unwrap();
    assert_eq!(record.cause_class.as_deref(), Some("timeout"));
}

#[test]
fn status_cache_follows_listener_set() {
    let site = Site::new();
    let mut engine = site.engine(ValidationPipeline::new());
    engine.on_event(EventKind::StatusCheck, 0, "disk", |e: &mut ValidationEvent| {
        e.add_warning("disk 85% full");
        Ok(())
    });

    assert!(engine.cached_status().unwrap().is_none());
    let run = engine.status_if_absent().unwrap();
    assert_eq!(run.results, vec![ValidationResult::warning("disk 85% full")]);
    assert_eq!(engine.cached_status().unwrap(), Some(run.clone()));

    // A later request with the same listeners reuses the cached run.
    let mut again = site.engine(ValidationPipeline::new());
    again.on_event(EventKind::StatusCheck, 0, "disk", |e: &mut ValidationEvent| {
        e.add_warning("disk 85% full");
        Ok(())
    });
    assert_eq!(again.cached_status().unwrap(), Some(run));

    engine.on_event(EventKind::PreCreate, 0, "new_rule", |_e: &mut ValidationEvent| Ok(()));
    assert!(engine.cached_status().unwrap().is_none());
}

#[test]
fn status_warnings_do_not_block_transitions() {
    let site = Site::new();
    let mut pipeline = ValidationPipeline::new();
    for kind in [EventKind::PreCreate, EventKind::PreRequire, EventKind::PreApply] {
        pipeline.on_event(kind, 0, "advisory", |e: &mut ValidationEvent| {
            e.add_warning("consider a backup first");
            Ok(())
        });
    }
    let engine = site.engine(pipeline);
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();
    engine.apply(&mut stage).unwrap();
    assert_eq!(stage.state(), StageState::Applied);
}

#[test]
fn events_reach_listeners_in_lifecycle_order() {
    let site = Site::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut pipeline = ValidationPipeline::new();
    for kind in [
        EventKind::PreCreate,
        EventKind::PostCreate,
        EventKind::PreRequire,
        EventKind::PostRequire,
        EventKind::PreApply,
        EventKind::PostApply,
        EventKind::PreDestroy,
        EventKind::PostDestroy,
    ] {
        let seen = Arc::clone(&seen);
        pipeline.on_event(kind, 0, "trace", move |e: &mut ValidationEvent| {
            let has_stage = e.stage().is_some();
            let has_mutation = e.mutation().is_some();
            seen.lock().unwrap().push((e.kind(), has_stage, has_mutation));
            Ok(())
        });
    }
    let engine = site.engine(pipeline);
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    engine.require(&mut stage, &upgrade()).unwrap();
    engine.apply(&mut stage).unwrap();
    engine.destroy(&mut stage).unwrap();

    let seen = seen.lock().unwrap();
    let kinds: Vec<_> = seen.iter().map(|(k, _, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::PreCreate,
            EventKind::PostCreate,
            EventKind::PreRequire,
            EventKind::PostRequire,
            EventKind::PreApply,
            EventKind::PostApply,
            EventKind::PreDestroy,
            EventKind::PostDestroy,
        ]
    );
    assert_eq!(seen[0], (EventKind::PreCreate, false, false));
    assert_eq!(seen[2], (EventKind::PreRequire, true, true));
}

#[test]
fn concurrent_creates_have_one_winner() {
    let site = Site::new();
    let engines: Vec<_> = (0..4).map(|_| site.engine(ValidationPipeline::new())).collect();
    let barrier = Arc::new(Barrier::new(engines.len()));

    let winners = thread::scope(|scope| {
        let handles: Vec<_> = engines
            .iter()
            .enumerate()
            .map(|(i, engine)| {
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    engine
                        .create(&OwnerToken::new(format!("host{i}")), Metadata::new())
                        .is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count()
    });
    assert_eq!(winners, 1);
}

/// Stand-in for the dependency tool: records each invocation in the lock
/// file and, on `update`, swaps the vendored package.
#[cfg(unix)]
fn fake_tool(dir: &Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("fake-composer");
    fs::write(
        &script,
        "#!/bin/sh\n\
         echo \"$*\" >> composer.lock\n\
         if [ \"$1\" = update ]; then\n\
           rm -rf vendor/acme/widgets\n\
           mkdir -p vendor/acme/gadgets\n\
           echo '<?php // 2.0' > vendor/acme/gadgets/Gadget.php\n\
         fi\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[cfg(unix)]
#[test]
fn filesystem_executor_applies_real_changes() {
    let site = Site::new();
    let tool = fake_tool(site.dir.path());
    let mut config = site.config.clone();
    config.site.exclude = vec!["web/files".into()];
    config.executor.program = tool.to_string_lossy().into_owned();
    fs::create_dir_all(site.active().join("web/files")).unwrap();
    fs::write(site.active().join("web/files/upload.png"), "png").unwrap();

    let engine = StageEngine::new(
        config.clone(),
        Arc::clone(&site.kv),
        Arc::new(FsExecutor::new(config.executor.program.clone())),
        ValidationPipeline::new(),
    )
    .unwrap();
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    assert!(!stage.staging_root().join("web/files").exists());

    engine.require(&mut stage, &upgrade()).unwrap();
    let staged_lock = fs::read_to_string(stage.staging_root().join("composer.lock")).unwrap();
    assert!(staged_lock.contains("require --no-update acme/widgets:^2.0"));
    // The live codebase is untouched until apply.
    assert!(site.active().join("vendor/acme/widgets/Widget.php").exists());

    engine.apply(&mut stage).unwrap();
    assert!(!site.active().join("vendor/acme/widgets").exists());
    assert!(site.active().join("vendor/acme/gadgets/Gadget.php").exists());
    assert!(site.active().join("web/files/upload.png").exists());
    assert_eq!(
        fs::read_to_string(site.active().join("composer.lock")).unwrap(),
        staged_lock
    );

    engine.destroy(&mut stage).unwrap();
    assert!(!stage.staging_root().exists());
    assert!(engine.current_stage().unwrap().is_none());
}

#[cfg(unix)]
#[test]
fn failing_tool_leaves_stage_created() {
    let site = Site::new();
    let mut config = site.config.clone();
    config.executor.program = "false".to_owned();
    let engine = StageEngine::new(
        config,
        Arc::clone(&site.kv),
        Arc::new(FsExecutor::new("false")),
        ValidationPipeline::new(),
    )
    .unwrap();
    let mut stage = engine.create(&alice(), Metadata::new()).unwrap();
    assert!(matches!(
        engine.require(&mut stage, &upgrade()),
        Err(CoreError::Operation(_))
    ));
    assert_eq!(stage.state(), StageState::Created);
    engine.destroy(&mut stage).unwrap();
}
