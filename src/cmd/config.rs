//! Configuration view and validation commands: `pcc config`.

use anyhow::{Result, bail};

use pcc::config::PccConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &PccConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config.config_path.exists() {
                println!("# {}", config.config_path.display());
            } else {
                println!(
                    "# {} not found; showing defaults",
                    config.config_path.display()
                );
            }
            print!("{}", toml::to_string_pretty(&config.toml)?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.toml.validate();
            if !problems.is_empty() {
                for problem in &problems {
                    eprintln!("  - {problem}");
                }
                bail!("{} configuration problem(s)", problems.len());
            }
            println!("Configuration is valid");
        }
    }
    Ok(())
}
