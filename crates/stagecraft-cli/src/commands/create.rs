use super::{colorize_state, json_pretty, parse_metadata, with_spinner, EXIT_SUCCESS};
use stagecraft_core::StageEngine;
use stagecraft_schema::OwnerToken;

pub fn run(engine: &StageEngine, owner: &OwnerToken, meta: &[String], json: bool) -> Result<u8, String> {
    let metadata = parse_metadata(meta)?;
    let stage = with_spinner(
        json,
        "creating stage...",
        "stage created",
        "create failed",
        || engine.create(owner, metadata),
    )?;

    if json {
        println!("{}", json_pretty(stage.record())?);
    } else {
        println!("stage_id:  {}", stage.id());
        println!("owner:     {}", stage.owner());
        println!("state:     {}", colorize_state(&stage.state().to_string()));
        println!("staging:   {}", stage.staging_root().display());
    }
    Ok(EXIT_SUCCESS)
}
