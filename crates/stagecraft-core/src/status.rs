use crate::events::ValidationEvent;
use crate::pipeline::ValidationPipeline;
use crate::result::ValidationResult;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use stagecraft_schema::SiteKey;
use stagecraft_store::{KeyValueStore, KeyValueStoreExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedValidationRun {
    pub results: Vec<ValidationResult>,
    pub listener_signature: String,
    pub computed_at: String,
}

impl CachedValidationRun {
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(ValidationResult::is_error)
    }
}

/// Per-site cache of the last status-check run.
///
/// An entry is served only while its TTL holds and its listener signature
/// matches the live pipeline's.
pub struct ValidationResultCache {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    ttl: Duration,
}

impl ValidationResultCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, site: &SiteKey, ttl: Duration) -> Self {
        Self {
            kv,
            key: format!("{site}.status_check"),
            ttl,
        }
    }

    /// Dispatch `event` and store its results, replacing any earlier run.
    pub fn run(
        &self,
        pipeline: &ValidationPipeline,
        mut event: ValidationEvent,
    ) -> Result<CachedValidationRun, CoreError> {
        info!("running status check");
        pipeline.dispatch(&mut event);
        let run = CachedValidationRun {
            results: event.into_results(),
            listener_signature: pipeline.signature(),
            computed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.kv.set_json(&self.key, &run, Some(self.ttl))?;
        debug!("cached {} status results", run.results.len());
        Ok(run)
    }

    pub fn get_cached(
        &self,
        pipeline: &ValidationPipeline,
    ) -> Result<Option<CachedValidationRun>, CoreError> {
        let Some(run) = self.kv.get_json::<CachedValidationRun>(&self.key)? else {
            return Ok(None);
        };
        if run.listener_signature != pipeline.signature() {
            debug!("cached status run is stale: listener set changed");
            return Ok(None);
        }
        Ok(Some(run))
    }

    /// Serve the cached run, computing it from `make_event` only when absent.
    pub fn run_if_absent(
        &self,
        pipeline: &ValidationPipeline,
        make_event: impl FnOnce() -> ValidationEvent,
    ) -> Result<CachedValidationRun, CoreError> {
        match self.get_cached(pipeline)? {
            Some(run) => Ok(run),
            None => self.run(pipeline, make_event()),
        }
    }

    pub fn invalidate(&self) -> Result<(), CoreError> {
        self.kv.delete(&self.key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use stagecraft_schema::StageConfig;
    use stagecraft_store::{MemoryKvStore, PathResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> ValidationEvent {
        let paths = PathResolver::new(&StageConfig::for_active_root("/srv/app"));
        ValidationEvent::new(EventKind::StatusCheck, paths, None)
    }

    fn cache(ttl: Duration) -> ValidationResultCache {
        ValidationResultCache::new(Arc::new(MemoryKvStore::new()), &SiteKey::new("site"), ttl)
    }

    fn warning_pipeline() -> ValidationPipeline {
        let mut p = ValidationPipeline::new();
        p.on_event(EventKind::StatusCheck, 0, "warn", |e: &mut ValidationEvent| {
            e.add_warning("disk getting full");
            Ok(())
        });
        p
    }

    #[test]
    fn run_then_get_cached() {
        let cache = cache(Duration::from_secs(60));
        let p = warning_pipeline();
        assert!(cache.get_cached(&p).unwrap().is_none());

        let run = cache.run(&p, event()).unwrap();
        assert_eq!(run.results, vec![ValidationResult::warning("disk getting full")]);
        assert!(!run.has_errors());
        assert_eq!(cache.get_cached(&p).unwrap(), Some(run));
    }

    #[test]
    fn listener_change_invalidates_within_ttl() {
        let cache = cache(Duration::from_secs(3600));
        let mut p = warning_pipeline();
        cache.run(&p, event()).unwrap();
        p.on_event(EventKind::PreApply, 0, "new", |_e: &mut ValidationEvent| Ok(()));
        assert!(cache.get_cached(&p).unwrap().is_none());
    }

    #[test]
    fn ttl_expiry_invalidates() {
        let cache = cache(Duration::from_millis(50));
        let p = warning_pipeline();
        cache.run(&p, event()).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get_cached(&p).unwrap().is_none());
    }

    #[test]
    fn run_if_absent_only_runs_once() {
        let cache = cache(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p = ValidationPipeline::new();
        let counter = Arc::clone(&calls);
        p.on_event(EventKind::StatusCheck, 0, "count", move |_e: &mut ValidationEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        cache.run_if_absent(&p, event).unwrap();
        cache.run_if_absent(&p, event).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate().unwrap();
        cache.run_if_absent(&p, event).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_always_recomputes() {
        let cache = cache(Duration::from_secs(60));
        let p = warning_pipeline();
        let first = cache.run(&p, event()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = cache.run(&p, event()).unwrap();
        assert_ne!(first.computed_at, second.computed_at);
    }
}
