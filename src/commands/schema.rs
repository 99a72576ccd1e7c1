use schemars::schema_for;

use crate::config::{CONFIG_TOML, Config};

/// Print the JSON Schema for `.relay.toml` to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let mut schema = serde_json::to_value(schema_for!(Config))?;
    if let Some(obj) = schema.as_object_mut() {
        obj.insert(
            "description".into(),
            format!("relay project configuration ({CONFIG_TOML})").into(),
        );
    }
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
