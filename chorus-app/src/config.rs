//! Persona configuration file.
//!
//! A TOML file with one `[[bots]]` table per persona. Loading validates the
//! set as a whole; duplicate user ids are fatal. The file is written back
//! once after startup when access tokens were provisioned.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotsFile {
    #[serde(default)]
    pub bots: Vec<PersonaConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespondPolicy {
    Always,
    Sometimes,
    Mentioned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub model: String,
    pub homeserver_url: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub reactions: bool,
    pub respond: RespondPolicy,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    /// Full sender id to display label overrides.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Ordered rewrite rules; first match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_aliases: Vec<MessageAliasRule>,
    #[serde(default)]
    pub system_prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAliasRule {
    pub pattern: String,
    pub alias: String,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

impl BotsFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("read config {}: {e}", path.display()))?;
        let file: Self = toml::from_str(&contents)
            .map_err(|e| anyhow!("parse config {}: {e}", path.display()))?;
        file.validate()?;
        Ok(file)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("serialize config: {e}"))?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| anyhow!("write config {}: {e}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for bot in &self.bots {
            if bot.model.trim().is_empty() {
                return Err(anyhow!("bot {}: model is required", bot.user_id));
            }
            if bot.homeserver_url.trim().is_empty() {
                return Err(anyhow!("bot {}: homeserver_url is required", bot.user_id));
            }
            if bot.username.trim().is_empty() {
                return Err(anyhow!("bot {}: username is required", bot.user_id));
            }
            if !seen.insert(bot.user_id.as_str()) {
                return Err(anyhow!("multiple bots with user id {}", bot.user_id));
            }
        }
        Ok(())
    }
}
