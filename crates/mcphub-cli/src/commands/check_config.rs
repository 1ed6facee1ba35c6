//! `mcphub check-config`

use std::path::Path;

use mcphub_core::Config;

pub fn run(path: Option<&Path>) -> anyhow::Result<()> {
    let config = match path {
        Some(path) => {
            println!("Config file: {}", path.display());
            Config::load_from(path)?
        }
        None => {
            println!("Config directory: {}", Config::config_dir().display());
            Config::load()?
        }
    };

    let result = config.validate();
    for warning in result.warnings() {
        println!("  warning {}: {}", warning.field, warning.message);
    }
    for error in result.errors() {
        println!("  error   {}: {}", error.field, error.message);
    }

    println!("Store: {:?} at {}", config.store.backend, config.store.database_path().display());
    println!("Seed servers: {}", config.servers.len());

    if result.is_ok() {
        println!("Configuration OK");
        Ok(())
    } else {
        anyhow::bail!("configuration has {} error(s)", result.errors().len())
    }
}
