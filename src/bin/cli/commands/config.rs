use std::path::Path;

use anyhow::Result;

use nous_sync::sync::SendChangesConfig;

use crate::OutputFormat;

/// Print the configuration in effect and the file it was read from
pub fn run(config: &SendChangesConfig, path: Option<&Path>, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Plain => {
            println!("Config file:           {}", describe_source(path));
            println!("Token expiry margin:   {}s", config.token_expiry_margin_secs);
            println!("Mailbox capacity:      {}", config.mailbox_capacity);
        }
    }
    Ok(())
}

fn describe_source(path: Option<&Path>) -> String {
    match path {
        Some(path) if path.exists() => path.display().to_string(),
        Some(path) => format!("{} (not found, using defaults)", path.display()),
        None => "none (using defaults)".to_string(),
    }
}
