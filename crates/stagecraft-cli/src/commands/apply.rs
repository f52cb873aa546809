use super::{colorize_state, json_pretty, owned_stage, with_spinner, EXIT_SUCCESS};
use stagecraft_core::{shutdown_requested, StageEngine};
use stagecraft_schema::OwnerToken;

pub fn run(engine: &StageEngine, owner: &OwnerToken, json: bool) -> Result<u8, String> {
    let mut stage = owned_stage(engine, owner)?;
    with_spinner(
        json,
        "applying staged changes...",
        "changes applied",
        "apply failed",
        || engine.apply(&mut stage),
    )?;
    if shutdown_requested() {
        tracing::info!("shutdown was requested during apply; apply completed first");
    }

    if json {
        let payload = serde_json::json!({
            "stage_id": stage.id(),
            "state": stage.state().to_string(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "stage {} is {}",
            stage.id(),
            colorize_state(&stage.state().to_string())
        );
    }
    Ok(EXIT_SUCCESS)
}
