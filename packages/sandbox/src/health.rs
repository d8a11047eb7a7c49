// ABOUTME: Readiness gating for the execution service
// ABOUTME: Verifies or pulls every registered language image before sessions are accepted

use crate::providers::{Provider, ProviderError};
use crate::LanguageRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum Readiness {
    Preparing,
    Ready,
    Failed(String),
}

/// Shared readiness flag read by request handlers
#[derive(Debug, Clone)]
pub struct ReadinessState {
    inner: Arc<RwLock<Readiness>>,
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Readiness::Preparing)),
        }
    }

    pub async fn get(&self) -> Readiness {
        self.inner.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        *self.inner.read().await == Readiness::Ready
    }

    pub async fn set(&self, readiness: Readiness) {
        *self.inner.write().await = readiness;
    }
}

/// Makes sure every image the registry references is present locally
pub struct ImagePreparer {
    provider: Arc<dyn Provider>,
    registry: Arc<LanguageRegistry>,
}

impl ImagePreparer {
    pub fn new(provider: Arc<dyn Provider>, registry: Arc<LanguageRegistry>) -> Self {
        Self { provider, registry }
    }

    /// Verify each image, pulling the missing ones. Stops at the first failure.
    pub async fn prepare(&self) -> Result<(), ProviderError> {
        if !self.provider.is_available().await? {
            return Err(ProviderError::ConnectionError(
                "Docker daemon not responding".to_string(),
            ));
        }

        for image in self.registry.images() {
            if self.provider.image_exists(image).await? {
                info!("Image {} present", image);
                continue;
            }
            info!("Pulling {}...", image);
            self.provider.pull_image(image).await?;
        }

        Ok(())
    }

    /// Run `prepare` and publish the outcome to `state`
    pub async fn prepare_into(&self, state: &ReadinessState) -> Result<(), ProviderError> {
        state.set(Readiness::Preparing).await;
        match self.prepare().await {
            Ok(()) => {
                info!(
                    languages = self.registry.len(),
                    "All language images ready"
                );
                state.set(Readiness::Ready).await;
                Ok(())
            }
            Err(e) => {
                error!("Image preparation failed: {}", e);
                state.set(Readiness::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readiness_starts_preparing() {
        let state = ReadinessState::new();
        assert_eq!(state.get().await, Readiness::Preparing);
        assert!(!state.is_ready().await);

        state.set(Readiness::Ready).await;
        assert!(state.clone().is_ready().await);
    }

    #[test]
    fn test_readiness_wire_format() {
        let failed = serde_json::to_value(Readiness::Failed("no daemon".to_string())).unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["message"], "no daemon");

        let ready = serde_json::to_value(Readiness::Ready).unwrap();
        assert_eq!(ready["status"], "ready");
    }
}
