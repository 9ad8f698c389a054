//! Container naming and image reference conventions
//!
//! Container names encode lifecycle state: warm-pool containers carry the warm
//! prefix plus a numeric index, assigned servers carry the server prefix plus
//! their stable server ID. Image references are `<base><separator><version>`.

use crate::config::OrchestratorConfig;

/// What a container name says about the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerKind {
    /// Warm-pool container with its numeric suffix (0 when absent)
    Warm(u64),
    /// Assigned server with its stable server ID
    Assigned(String),
    /// Not managed by this orchestrator
    Foreign,
}

#[derive(Debug, Clone)]
pub struct NamingScheme {
    server_prefix: String,
    warm_prefix: String,
    base_image: String,
    version_separator: String,
}

impl NamingScheme {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            server_prefix: config.naming.server_prefix.clone(),
            warm_prefix: config.naming.warm_prefix.clone(),
            base_image: config.image.base_image.clone(),
            version_separator: config.image.version_separator.clone(),
        }
    }

    pub fn server_prefix(&self) -> &str {
        &self.server_prefix
    }

    pub fn warm_prefix(&self) -> &str {
        &self.warm_prefix
    }

    pub fn warm_name(&self, index: u64) -> String {
        format!("{}{}", self.warm_prefix, index)
    }

    pub fn server_name(&self, server_id: &str) -> String {
        format!("{}{}", self.server_prefix, server_id)
    }

    pub fn image_for(&self, version: &str) -> String {
        format!("{}{}{}", self.base_image, self.version_separator, version)
    }

    /// Game version encoded in an image reference
    pub fn version_from_image(&self, image: &str) -> Option<String> {
        image
            .rsplit_once(&self.version_separator)
            .map(|(_, version)| version.to_string())
            .filter(|v| !v.is_empty())
    }

    /// Classify a runtime container name. The runtime reports names with a
    /// leading `/`, which is ignored here.
    pub fn classify(&self, name: &str) -> ContainerKind {
        let name = name.trim_start_matches('/');

        // The warm prefix may itself start with the server prefix, so it is
        // checked first.
        if let Some(suffix) = name.strip_prefix(&self.warm_prefix) {
            if suffix.is_empty() {
                return ContainerKind::Warm(0);
            }
            if let Ok(index) = suffix.parse() {
                return ContainerKind::Warm(index);
            }
        }

        match name.strip_prefix(&self.server_prefix) {
            Some(server_id) if !server_id.is_empty() => ContainerKind::Assigned(server_id.to_string()),
            _ => ContainerKind::Foreign,
        }
    }

    pub fn is_warm(&self, name: &str) -> bool {
        matches!(self.classify(name), ContainerKind::Warm(_))
    }
}
