use super::{json_pretty, print_results, EXIT_SUCCESS, EXIT_VALIDATION_ERROR};
use stagecraft_core::StageEngine;

/// Show the site status check, served from cache unless `refresh` is set or
/// the listener set changed since the cached run.
pub fn run(engine: &StageEngine, refresh: bool, json: bool) -> Result<u8, String> {
    let run = if refresh {
        engine.run_status_check()
    } else {
        engine.status_if_absent()
    }
    .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&run)?);
    } else if run.results.is_empty() {
        println!("site OK (checked {})", run.computed_at);
    } else {
        print_results(&run.results);
        println!("checked {}", run.computed_at);
    }

    if run.has_errors() {
        Ok(EXIT_VALIDATION_ERROR)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
