pub mod apply;
pub mod create;
pub mod destroy;
pub mod inspect;
pub mod marker;
pub mod require;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use stagecraft_core::{Metadata, Stage, StageEngine, ValidationResult};
use stagecraft_schema::OwnerToken;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_VALIDATION_ERROR: u8 = 4;
pub const EXIT_MARKER_PRESENT: u8 = 5;

/// Map an error message to the process exit code.
///
/// Commands report failures as strings, so the category is recovered from
/// the message prefix the lower crates put on each error.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:") || msg.starts_with("failed to parse config") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") {
        EXIT_STORE_ERROR
    } else if msg.starts_with("stage validation failed") {
        EXIT_VALIDATION_ERROR
    } else if msg.starts_with("failure marker present") || msg.starts_with("apply of stage") {
        EXIT_MARKER_PRESENT
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Run `op` under a spinner unless the output is JSON.
pub fn with_spinner<T, E: ToString>(
    json: bool,
    running: &str,
    done: &str,
    failed: &str,
    op: impl FnOnce() -> Result<T, E>,
) -> Result<T, String> {
    let pb = (!json).then(|| spinner(running));
    match op() {
        Ok(value) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, done);
            }
            Ok(value)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, failed);
            }
            Err(e.to_string())
        }
    }
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "available" => Style::new().green().apply_to(state).to_string(),
        "created" => Style::new().yellow().apply_to(state).to_string(),
        "staged" => Style::new().cyan().apply_to(state).to_string(),
        "applying" => Style::new().red().bold().apply_to(state).to_string(),
        "applied" => Style::new().green().bold().apply_to(state).to_string(),
        "destroyed" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

pub fn print_results(results: &[ValidationResult]) {
    use console::Style;
    for result in results {
        let tag = if result.is_error() {
            Style::new().red().apply_to("error")
        } else {
            Style::new().yellow().apply_to("warning")
        };
        match result.summary() {
            Some(summary) => {
                println!("{tag}: {summary}");
                for msg in result.messages() {
                    println!("    - {msg}");
                }
            }
            None => {
                for msg in result.messages() {
                    println!("{tag}: {msg}");
                }
            }
        }
    }
}

/// Reattach `owner` to the site's current stage.
pub fn owned_stage(engine: &StageEngine, owner: &OwnerToken) -> Result<Stage, String> {
    let record = engine
        .current_stage()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "no active stage on this site; run `stagecraft create` first".to_owned())?;
    engine
        .claim(&record.stage_id, owner)
        .map_err(|e| e.to_string())
}

/// Owner token used when `--owner` is not given: `user@host` from the
/// environment.
pub fn default_owner() -> String {
    let user = ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "stagecraft".to_owned());
    let host = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "localhost".to_owned());
    format!("{user}@{host}")
}

/// Parse repeated `key=value` pairs. Values that parse as JSON keep their
/// type; anything else is stored as a string.
pub fn parse_metadata(pairs: &[String]) -> Result<Metadata, String> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --meta '{pair}', expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("invalid --meta '{pair}': empty key"));
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()));
        metadata.insert(key.to_owned(), value);
    }
    Ok(metadata)
}
