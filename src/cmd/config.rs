//! Effective configuration view: `promptreel config`.

use std::path::Path;

use anyhow::Result;
use promptreel::config::StudioToml;

pub fn cmd_config(path: &Path, config: &StudioToml) -> Result<()> {
    println!();
    println!("promptreel Configuration");
    println!("========================");
    println!();
    if path.exists() {
        println!("Config file: {}", path.display());
    } else {
        println!("Config file: {} (not found, using defaults)", path.display());
    }
    println!();
    println!("{}", config.redacted().to_toml_string()?);

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}
