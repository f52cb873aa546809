use super::{json_pretty, owned_stage, EXIT_SUCCESS};
use stagecraft_core::StageEngine;
use stagecraft_schema::OwnerToken;

pub fn run(engine: &StageEngine, owner: &OwnerToken, json: bool) -> Result<u8, String> {
    let mut stage = owned_stage(engine, owner)?;
    engine.destroy(&mut stage).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({
            "stage_id": stage.id(),
            "status": "destroyed",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("destroyed stage {}", stage.id());
    }
    Ok(EXIT_SUCCESS)
}
