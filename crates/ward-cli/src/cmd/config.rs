use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;
use ward_core::config::WarnLevel;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Check the config for errors and suspicious settings
    Validate,

    /// Print the effective config, defaults filled in
    Show,
}

pub fn run(config: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(config, json),
        ConfigSubcommand::Show => show(config, json),
    }
}

fn validate(config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

fn show(config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}
