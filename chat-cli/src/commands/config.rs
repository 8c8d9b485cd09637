//! Print the effective configuration.

use anyhow::{Context, Result};
use chat_client::ClientConfig;

/// Run the config command.
pub fn run(config: &ClientConfig, validate: bool) -> Result<()> {
    if validate {
        config.validate().context("Invalid configuration")?;
    }

    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{}", rendered);

    if validate {
        println!();
        println!("# configuration is valid");
    }

    Ok(())
}
