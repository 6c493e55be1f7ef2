//! Configuration view and validation commands: `planwright config`.

use anyhow::{Context, Result};
use planwright::config::{PlanwrightConfig, PlanwrightToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &PlanwrightConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No planwright.toml at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (with environment overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No planwright.toml found. Using defaults (valid).");
                return Ok(());
            }
            if config.warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &config.warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("planwright.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.config_dir)
                .with_context(|| format!("Failed to create {}", config.config_dir.display()))?;
            PlanwrightToml::default().save(&config_path)?;

            println!("Created planwright.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [backend] provider, repo, trunk, labels");
            println!("  - [branches] prefix, max_slug_len");
            println!("  - [preprocess] and [pipeline] for learn runs");
        }
    }

    Ok(())
}
