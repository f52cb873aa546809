use super::{colorize_state, json_pretty, owned_stage, with_spinner, EXIT_SUCCESS};
use stagecraft_core::StageEngine;
use stagecraft_schema::{MutationSpec, OwnerToken};

pub fn run(
    engine: &StageEngine,
    owner: &OwnerToken,
    packages: &[String],
    dev: &[String],
    json: bool,
) -> Result<u8, String> {
    let mutation = MutationSpec::new(packages, dev).map_err(|e| format!("invalid mutation: {e}"))?;
    let mut stage = owned_stage(engine, owner)?;

    let names = mutation.package_names().join(", ");
    with_spinner(
        json,
        &format!("requiring {names}..."),
        "packages staged",
        "require failed",
        || engine.require(&mut stage, &mutation),
    )?;

    if json {
        let payload = serde_json::json!({
            "stage_id": stage.id(),
            "state": stage.state().to_string(),
            "runtime": mutation.runtime,
            "dev": mutation.dev,
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
