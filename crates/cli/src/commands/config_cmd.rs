//! `ciq config` — print the effective configuration.

use ciq_config::AppConfig;

use crate::runtime;

const REDACTED: &str = "[REDACTED]";

pub fn run(path_only: bool) -> anyhow::Result<()> {
    if path_only {
        println!("{}", AppConfig::config_dir().join("config.toml").display());
        return Ok(());
    }
    let config = runtime::load_config()?;
    println!("{}", render(&config)?);
    Ok(())
}

/// The configuration as TOML, with every secret masked.
fn render(config: &AppConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some(REDACTED.into());
    }
    if shown.embedding.api_key.is_some() {
        shown.embedding.api_key = Some(REDACTED.into());
    }
    Ok(toml::to_string_pretty(&shown)?)
}
