use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use crate::config::{Config, LlmConfig};
use crate::error::{RagError, Result};
use crate::store::{IdentityProvider, ModelConfigProvider, ModelEndpoint, UserIdentity};

/// Id under which the env-configured model is registered.
pub const DEFAULT_MODEL_ID: &str = "default";

/// Fixed table of chat models: the configured default plus any listed in
/// a JSON file.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelEndpoint>,
}

impl ModelRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::default();
        registry.insert(default_endpoint(&config.llm)?);

        if let Some(path) = &config.models_file {
            for endpoint in load_models_file(path)? {
                registry.insert(endpoint);
            }
        }
        tracing::info!("Registered {} chat model(s)", registry.models.len());
        Ok(registry)
    }

    pub fn insert(&mut self, endpoint: ModelEndpoint) {
        self.models.insert(endpoint.id.clone(), endpoint);
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

fn default_endpoint(llm: &LlmConfig) -> Result<ModelEndpoint> {
    Ok(ModelEndpoint {
        id: DEFAULT_MODEL_ID.to_string(),
        endpoint: llm.base_url.clone(),
        credential: llm.api_key.clone(),
        provider_kind: llm.provider.parse()?,
        model_name: llm.chat_model.clone(),
    })
}

fn load_models_file(path: &Path) -> Result<Vec<ModelEndpoint>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| RagError::config(format!("read models file {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| RagError::config(format!("parse models file {}: {e}", path.display())))
}

#[async_trait]
impl ModelConfigProvider for ModelRegistry {
    async fn get_model(&self, model_id: &str) -> Result<ModelEndpoint> {
        self.models
            .get(model_id)
            .cloned()
            .ok_or_else(|| RagError::config(format!("unknown model: {model_id}")))
    }
}

/// Every request runs as one configured user.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user_id: String,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<UserIdentity> {
        Ok(UserIdentity {
            id: self.user_id.clone(),
        })
    }
}
