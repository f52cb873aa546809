use super::{json_pretty, EXIT_MARKER_PRESENT, EXIT_SUCCESS};
use stagecraft_core::StageEngine;

/// Print the failure marker. Exits with the marker code while one exists so
/// scripts can gate on it.
pub fn show(engine: &StageEngine, json: bool) -> Result<u8, String> {
    let marker = engine.failure_marker();
    let record = match marker.read() {
        Ok(record) => record,
        Err(e) => {
            eprintln!("warning: {} is unreadable: {e}", marker.path().display());
            return Ok(EXIT_MARKER_PRESENT);
        }
    };

    let Some(record) = record else {
        if json {
            println!("{}", json_pretty(&serde_json::Value::Null)?);
        } else {
            println!("no failure marker");
        }
        return Ok(EXIT_SUCCESS);
    };

    if json {
        println!("{}", json_pretty(&record)?);
    } else {
        println!("path:       {}", marker.path().display());
        println!("stage_id:   {}", record.stage_id);
        println!("message:    {}", record.message);
        println!("written_at: {}", record.written_at);
        if let Some(class) = &record.cause_class {
            println!("cause:      {class}");
        }
        if let Some(msg) = &record.cause_message {
            println!("detail:     {msg}");
        }
        if let Some(trace) = &record.cause_trace {
            println!("trace:\n{trace}");
        }
    }
    Ok(EXIT_MARKER_PRESENT)
}

/// Remove the marker after the codebase has been repaired by hand.
pub fn clear(engine: &StageEngine, json: bool) -> Result<u8, String> {
    let marker = engine.failure_marker();
    let existed = marker.exists();
    marker.clear().map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({ "cleared": existed });
        println!("{}", json_pretty(&payload)?);
    } else if existed {
        println!("failure marker cleared");
    } else {
        println!("no failure marker");
    }
    Ok(EXIT_SUCCESS)
}
