use crate::events::{EventKind, ValidationEvent};
use crate::result::ValidationResult;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type Listener = Box<dyn Fn(&mut ValidationEvent) -> Result<(), ListenerError> + Send + Sync>;

struct Registration {
    kind: EventKind,
    priority: i32,
    name: String,
    callback: Listener,
}

/// Explicit registry of `(kind, priority, name, callback)` validators.
///
/// Listeners for a kind run in descending priority; equal priorities keep
/// registration order. A listener that returns an error or panics is turned
/// into an error result carrying its failure and stops propagation.
#[derive(Default)]
pub struct ValidationPipeline {
    listeners: Vec<Registration>,
}

impl ValidationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&mut self, kind: EventKind, priority: i32, name: impl Into<String>, callback: F)
    where
        F: Fn(&mut ValidationEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("registered listener {name} for {kind} at priority {priority}");
        self.listeners.push(Registration {
            kind,
            priority,
            name,
            callback: Box::new(callback),
        });
    }

    fn ordered(&self, kind: EventKind) -> Vec<&Registration> {
        let mut selected: Vec<_> = self.listeners.iter().filter(|r| r.kind == kind).collect();
        // sort_by is stable: registration order breaks ties.
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));
        selected
    }

    /// Listener names for `kind` in dispatch order.
    pub fn listener_names(&self, kind: EventKind) -> Vec<&str> {
        self.ordered(kind).into_iter().map(|r| r.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn dispatch(&self, event: &mut ValidationEvent) {
        let kind = event.kind();
        for reg in self.ordered(kind) {
            if event.is_propagation_stopped() {
                debug!("propagation of {kind} stopped before {}", reg.name);
                break;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (reg.callback)(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            warn!("listener {} failed during {kind}: {failure}", reg.name);
            event.add_result(ValidationResult::error(format!(
                "validator '{}' failed: {failure}",
                reg.name
            )));
            event.stop_propagation();
        }
    }

    /// Order-sensitive structural hash of the registry.
    ///
    /// Covers every `(kind, priority, name)` in dispatch order, so adding,
    /// removing, renaming or re-prioritising a listener changes it.
    pub fn signature(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for kind in EventKind::ALL {
            for reg in self.ordered(kind) {
                hasher.update(kind.as_str().as_bytes());
                hasher.update(b"\0");
                hasher.update(reg.priority.to_string().as_bytes());
                hasher.update(b"\0");
                hasher.update(reg.name.as_bytes());
                hasher.update(b"\n");
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}
