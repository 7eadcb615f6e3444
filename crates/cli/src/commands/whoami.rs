// `cowrite whoami`: the identity sessions will publish.

use clap::Args;
use cowrite_common::identity::resolve_color;
use cowrite_session::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WhoamiArgs {
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhoamiResult {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub relay_host: Option<String>,
    /// Fields not set in the config, generated for this run only.
    pub generated: Vec<String>,
}

pub fn run(args: WhoamiArgs, config: &ClientConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    output::print_output(format, &whoami(config), format_human)?;
    Ok(())
}

fn whoami(config: &ClientConfig) -> WhoamiResult {
    let profile = config.profile();
    let mut generated = Vec::new();
    if config.user.name.as_deref().map_or(true, |name| name.trim().is_empty()) {
        generated.push("name".to_string());
    }
    if config.user.color.as_deref().and_then(resolve_color).is_none() {
        generated.push("color".to_string());
    }
    if config.user.avatar.is_none() {
        generated.push("avatar".to_string());
    }
    WhoamiResult {
        name: profile.name,
        color: profile.color,
        avatar: profile.avatar,
        relay_host: config.relay_host.clone(),
        generated,
    }
}

fn format_human(result: &WhoamiResult) -> String {
    let mut lines = vec![
        format!("Name:   {}", result.name),
        format!("Color:  {}", result.color),
        format!("Avatar: {}", result.avatar.as_deref().unwrap_or("-")),
        format!("Relay:  {}", result.relay_host.as_deref().unwrap_or("(not configured)")),
    ];
    if !result.generated.is_empty() {
        lines.push(format!(
            "Generated for this run: {} (set them in ~/.cowrite/config.toml to keep them)",
            result.generated.join(", ")
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_session::config::UserConfig;

    #[test]
    fn configured_identity_is_reported_as_is() {
        let config = ClientConfig {
            relay_host: Some("relay.example".into()),
            user: UserConfig {
                name: Some("Ava".into()),
                color: Some("blue".into()),
                avatar: Some("https://example.com/ava.svg".into()),
            },
            ..ClientConfig::default()
        };
        let result = whoami(&config);
        assert_eq!(result.name, "Ava");
        assert_eq!(result.color, "#60a5fa");
        assert!(result.generated.is_empty());
        assert!(!format_human(&result).contains("Generated"));
    }

    #[test]
    fn missing_fields_are_generated_and_listed() {
        let config = ClientConfig {
            user: UserConfig { color: Some("chartreuse".into()), ..UserConfig::default() },
            ..ClientConfig::default()
        };
        let result = whoami(&config);
        assert!(!result.name.is_empty());
        assert!(result.color.starts_with('#'));
        assert_eq!(result.generated, vec!["name", "color", "avatar"]);

        let human = format_human(&result);
        assert!(human.contains("(not configured)"));
        assert!(human.contains("name, color, avatar"));
    }
}
