use ilef_common::ProviderKind;
use ilef_providers::aws::AwsProvider;
use ilef_providers::azure::AzureProvider;
use ilef_providers::gcp::GcpProvider;
use ilef_providers::hetzner::HetznerProvider;
use ilef_providers::{AdminAccess, CloudProvider, ProviderError};
use std::collections::HashMap;
use std::sync::Arc;

use crate::settings::Settings;

/// Backends configured for this process, keyed by provider code.
#[derive(Default)]
pub struct ProviderManager {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
    admin: AdminAccess,
}

impl ProviderManager {
    /// Build every backend whose settings are complete. A backend that
    /// fails to initialise is logged and left out.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut manager = Self {
            providers: HashMap::new(),
            admin: AdminAccess {
                key_name: settings.ssh.key_name.clone(),
                public_key: settings.ssh.public_key.clone(),
            },
        };

        if let Some(cfg) = &settings.aws {
            manager.register(ProviderKind::Aws, AwsProvider::new(cfg.clone()));
        }
        if let Some(cfg) = &settings.azure {
            manager.register(ProviderKind::Azure, AzureProvider::new(cfg.clone()));
        }
        if let Some(cfg) = &settings.gcp {
            manager.register(ProviderKind::Gcp, GcpProvider::new(cfg.clone()));
        }
        if let Some(cfg) = &settings.hetzner {
            manager.register(ProviderKind::Hetzner, HetznerProvider::new(cfg.clone()));
        }
        #[cfg(feature = "provider-mock")]
        {
            manager = manager.with_provider(Arc::new(ilef_providers::mock::MockProvider::new()));
        }

        tracing::info!("☁️ [ProviderManager] available providers: {:?}", manager.available());
        manager
    }

    fn register<P>(&mut self, kind: ProviderKind, built: Result<P, ProviderError>)
    where
        P: CloudProvider + 'static,
    {
        match built {
            Ok(provider) => {
                self.providers.insert(kind, Arc::new(provider));
            }
            Err(e) => tracing::error!("❌ [ProviderManager] {} disabled: {}", kind, e),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_admin_access(mut self, admin: AdminAccess) -> Self {
        self.admin = admin;
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CloudProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidSpec(format!("provider {} is not configured", kind)))
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Key material handed to every `create_instance`.
    pub fn admin_access(&self) -> AdminAccess {
        self.admin.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilef_providers::mock::MockProvider;

    #[test]
    fn only_configured_providers_are_available() {
        let settings = Settings::from_lookup(|name| match name {
            "HETZNER_API_TOKEN" => Some("tok".to_string()),
            "SSH_KEY_NAME" => Some("deploy".to_string()),
            _ => None,
        });
        let manager = ProviderManager::from_settings(&settings);
        assert!(manager.available().contains(&ProviderKind::Hetzner));
        assert!(!manager.available().contains(&ProviderKind::Aws));
        assert_eq!(manager.admin_access().key_name.as_deref(), Some("deploy"));

        let err = manager.get(ProviderKind::Aws).err().unwrap();
        assert_eq!(err.failure_reason(), ilef_common::FailureReason::InvalidSpec);
    }

    #[test]
    fn injected_provider_is_served() {
        let manager = ProviderManager::default().with_provider(Arc::new(MockProvider::new()));
        assert_eq!(manager.get(ProviderKind::Mock).unwrap().kind(), ProviderKind::Mock);
    }
}
