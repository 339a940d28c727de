//! Job definition registry: resolves an instance to the definition it was started from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use stepgate_core::{JobDefinition, JobInstance};

/// Registry error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown job type: {id} version {version}")]
    UnknownJobType { id: String, version: u32 },

    #[error("job definition already registered: {id} version {version}")]
    Duplicate { id: String, version: u32 },

    #[error("registry lock poisoned")]
    Poisoned,
}

/// Definitions keyed by `(definition id, version)`.
///
/// Several versions of the same definition may be registered at once; running
/// instances keep resolving to the version they were created with.
#[derive(Debug, Default)]
pub struct JobDefinitionRegistry {
    definitions: RwLock<HashMap<(String, u32), Arc<JobDefinition>>>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: JobDefinition) -> Result<Arc<JobDefinition>, RegistryError> {
        let key = (definition.id().to_string(), definition.version());
        let mut definitions = self.definitions.write().map_err(|_| RegistryError::Poisoned)?;
        if definitions.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                id: key.0,
                version: key.1,
            });
        }

        let definition = Arc::new(definition);
        info!(
            job_definition_id = %key.0,
            job_definition_version = key.1,
            steps = definition.steps().len(),
            gated = definition.is_gated_execution(),
            "job definition registered"
        );
        definitions.insert(key, Arc::clone(&definition));
        Ok(definition)
    }

    pub fn get(&self, id: &str, version: u32) -> Result<Arc<JobDefinition>, RegistryError> {
        let definitions = self.definitions.read().map_err(|_| RegistryError::Poisoned)?;
        definitions
            .get(&(id.to_string(), version))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownJobType {
                id: id.to_string(),
                version,
            })
    }

    /// Definition for `instance`, matched on id and version.
    pub fn resolve(&self, instance: &JobInstance) -> Result<Arc<JobDefinition>, RegistryError> {
        self.get(&instance.job_definition_id, instance.job_definition_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(version: u32) -> JobDefinition {
        JobDefinition::builder("reindex", version)
            .add_step("scan")
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_by_id_and_version() {
        let registry = JobDefinitionRegistry::new();
        registry.register(definition(1)).unwrap();
        registry.register(definition(2)).unwrap();

        let instance = JobInstance::new(&definition(2));
        assert_eq!(registry.resolve(&instance).unwrap().version(), 2);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let registry = JobDefinitionRegistry::new();
        registry.register(definition(1)).unwrap();

        let instance = JobInstance::new(&definition(3));
        let err = registry.resolve(&instance).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownJobType { version: 3, .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = JobDefinitionRegistry::new();
        registry.register(definition(1)).unwrap();
        assert!(matches!(
            registry.register(definition(1)),
            Err(RegistryError::Duplicate { .. })
        ));
    }
}
