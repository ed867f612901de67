use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 7860)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "config/credentials.json")]
    pub credentials_file: String,
    #[arg(long, default_value = "config/models.json")]
    pub models_file: String,
    #[arg(long, default_value = "config/stats.json")]
    pub stats_file: String,
    #[arg(long, default_value_t = crate::constants::DEFAULT_POOL_SIZE)]
    pub pool_size: usize,
    #[arg(long, default_value_t = crate::constants::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, default_value_t = crate::constants::HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,
    #[arg(long, default_value_t = false)]
    pub disable_heartbeat: bool,
    /// Treat only 401/403 as auth failures; by default 400 also triggers a
    /// credential refresh because the backend reports stale tokens that way.
    #[arg(long, default_value_t = false)]
    pub strict_auth_statuses: bool,
}

impl Args {
    pub fn auth_statuses(&self) -> &'static [u16] {
        if self.strict_auth_statuses {
            crate::constants::STRICT_AUTH_STATUS_CODES
        } else {
            crate::constants::AUTH_RETRY_STATUS_CODES
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Low,
    High,
}

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub backend_model: String,
    pub thinking: Option<ThinkingMode>,
    /// "1k" / "2k" / "4k" when a resolution suffix was present
    pub resolution: Option<String>,
}

impl ResolvedModel {
    pub fn is_image_model(&self) -> bool {
        self.backend_model.contains("image")
    }
}

#[derive(Debug, Deserialize, Default)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    alias_map: HashMap<String, String>,
}

/// Client-facing model names: the advertised list plus an alias map onto
/// backend ids, with thinking and resolution suffixes parsed off the end.
#[derive(Debug, Default)]
pub struct ModelTable {
    models: Vec<String>,
    alias_map: HashMap<String, String>,
}

impl ModelTable {
    pub async fn load_or_default(path: &str) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<ModelsFile>(&raw) {
                Ok(file) => {
                    tracing::info!(
                        "[CONFIG] Loaded {} model(s), {} alias(es)",
                        file.models.len(),
                        file.alias_map.len()
                    );
                    Self {
                        models: file.models,
                        alias_map: file.alias_map,
                    }
                }
                Err(e) => {
                    tracing::warn!("[CONFIG] Models file unreadable: {}", e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("[CONFIG] No models file at {}, using passthrough", path);
                Self::default()
            }
        }
    }

    pub fn advertised_models(&self) -> &[String] {
        &self.models
    }

    pub fn resolve(&self, model: &str) -> ResolvedModel {
        let mut target = self
            .alias_map
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string());

        let mut thinking = None;
        if let Some(stripped) = target.strip_suffix("-low") {
            target = stripped.to_string();
            thinking = Some(ThinkingMode::Low);
        } else if let Some(stripped) = target.strip_suffix("-high") {
            target = stripped.to_string();
            thinking = Some(ThinkingMode::High);
        }

        let mut resolution = None;
        for suffix in ["-1k", "-2k", "-4k"] {
            if let Some(stripped) = target.strip_suffix(suffix) {
                resolution = Some(suffix[1..].to_string());
                target = stripped.to_string();
                break;
            }
        }

        ResolvedModel {
            backend_model: target,
            thinking,
            resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_without_alias() {
        let table = ModelTable::default();
        let resolved = table.resolve("gemini-2.5-flash");
        assert_eq!(resolved.backend_model, "gemini-2.5-flash");
        assert!(resolved.thinking.is_none());
        assert!(resolved.resolution.is_none());
    }

    #[test]
    fn test_alias_applied_before_suffixes() {
        let table = ModelTable {
            models: vec![],
            alias_map: HashMap::from([(
                "smart".to_string(),
                "gemini-3-pro-high".to_string(),
            )]),
        };
        let resolved = table.resolve("smart");
        assert_eq!(resolved.backend_model, "gemini-3-pro");
        assert_eq!(resolved.thinking, Some(ThinkingMode::High));
    }

    #[test]
    fn test_thinking_suffixes() {
        let table = ModelTable::default();
        assert_eq!(
            table.resolve("gemini-3-pro-low").thinking,
            Some(ThinkingMode::Low)
        );
        assert_eq!(
            table.resolve("gemini-3-pro-high").thinking,
            Some(ThinkingMode::High)
        );
    }

    #[test]
    fn test_resolution_suffixes() {
        let table = ModelTable::default();
        let resolved = table.resolve("gemini-image-gen-4k");
        assert_eq!(resolved.backend_model, "gemini-image-gen");
        assert_eq!(resolved.resolution.as_deref(), Some("4k"));
        assert!(resolved.is_image_model());
    }

    #[test]
    fn test_image_model_detection() {
        let table = ModelTable::default();
        assert!(table.resolve("gemini-image").is_image_model());
        assert!(!table.resolve("gemini-3-pro").is_image_model());
    }
}
