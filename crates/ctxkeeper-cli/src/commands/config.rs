//! Configuration management commands.

use ctxkeeper_core::config::IssueSeverity;
use ctxkeeper_core::Config;

use crate::{AppContext, ConfigAction};

pub fn handle(action: ConfigAction, ctx: &AppContext) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Sources: {}", Config::config_dir().join("config.toml").display());
            println!("#          .ctxkeeper/config.toml, .ctxkeeper/config.local.toml");
            println!("#          CTXKEEPER_* environment variables");
            println!();
            print!("{}", ctx.config.to_toml()?);
        }
        ConfigAction::Validate => {
            let result = ctx.config.validate();
            if result.issues.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }

            for issue in &result.issues {
                let label = match issue.severity {
                    IssueSeverity::Error => "error",
                    IssueSeverity::Warning => "warning",
                };
                println!("{}: {}: {}", label, issue.field, issue.message);
            }

            if !result.is_ok() {
                anyhow::bail!(
                    "configuration has {} error(s)",
                    result.errors().len()
                );
            }
        }
    }
    Ok(())
}
