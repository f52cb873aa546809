use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use stagecraft_core::StageEngine;
use stagecraft_store::StageState;

pub fn run(engine: &StageEngine, json: bool) -> Result<u8, String> {
    let record = engine.current_stage().map_err(|e| e.to_string())?;
    let marker = engine.failure_marker();

    if json {
        let payload = serde_json::json!({
            "site": engine.paths().site(),
            "active_root": engine.paths().active_root(),
            "stage": record,
            "failure_marker": marker.exists().then(|| marker.path()),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("site:        {}", engine.paths().site());
    println!("active_root: {}", engine.paths().active_root().display());
    match record {
        Some(record) => {
            println!("stage_id:    {}", record.stage_id);
            println!("owner:       {}", record.owner);
            println!("state:       {}", colorize_state(&record.state.to_string()));
            println!("staging:     {}", record.staging_root.display());
            println!("created_at:  {}", record.created_at);
            println!("updated_at:  {}", record.updated_at);
            for (key, value) in &record.metadata {
                println!("meta.{key}: {value}");
            }
        }
        None => println!(
            "state:       {}",
            colorize_state(&StageState::Available.to_string())
        ),
    }
    if marker.exists() {
        println!("marker:      {}", marker.path().display());
    }
    Ok(EXIT_SUCCESS)
}
