//! Image and data-domain configuration.
//!
//! Which container image runs a model and which host directory holds a data
//! domain are deployment facts, so both live in an externally supplied JSON
//! file rather than in code. Rank-0 services mount the resolved domain
//! directory; other ranks mount the scratch directory.

use crate::scheduler::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_scratch_dir() -> String {
    "/local".to_string()
}

fn default_container_data_dir() -> String {
    "/model/domains".to_string()
}

fn default_model_command() -> Vec<String> {
    vec!["/model/run_model.sh".to_string()]
}

fn default_ssh_command() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), "/usr/sbin/sshd -D".to_string()]
}

fn default_network() -> String {
    "mpi-net".to_string()
}

/// Externally configured mapping of models to images and data domains to
/// host directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDomainConfig {
    /// Model name to image tag.
    pub images: HashMap<String, String>,
    /// Data domain name to host directory holding its inputs.
    #[serde(default)]
    pub domains: HashMap<String, String>,
    /// Host directory mounted on non-rank-0 workers.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    /// Mount point for data inside worker containers.
    #[serde(default = "default_container_data_dir")]
    pub container_data_dir: String,
    /// Entrypoint command for the rank-0 container.
    #[serde(default = "default_model_command")]
    pub model_command: Vec<String>,
    /// Command run by the SSH-daemon containers on ranks 1..k.
    #[serde(default = "default_ssh_command")]
    pub ssh_command: Vec<String>,
    /// Overlay network every worker service attaches to.
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for ImageDomainConfig {
    fn default() -> Self {
        Self {
            images: HashMap::from([(
                "NWM".to_string(),
                "registry:5000/nwm:latest".to_string(),
            )]),
            domains: HashMap::new(),
            scratch_dir: default_scratch_dir(),
            container_data_dir: default_container_data_dir(),
            model_command: default_model_command(),
            ssh_command: default_ssh_command(),
            network: default_network(),
        }
    }
}

impl ImageDomainConfig {
    /// Load the mapping from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|err| {
            SchedulerError::Config(format!(
                "invalid images-and-domains file {}: {err}",
                path.display()
            ))
        })
    }

    /// Resolve the image for a model and the host directory for its data
    /// domain. An unknown domain falls back to the scratch directory.
    pub fn select(&self, model_name: &str, domain: Option<&str>) -> Result<(String, String)> {
        let image = self.images.get(model_name).cloned().ok_or_else(|| {
            SchedulerError::Config(format!("no image configured for model {model_name}"))
        })?;
        let domain_dir = domain
            .and_then(|name| self.domains.get(name).cloned())
            .unwrap_or_else(|| self.scratch_dir.clone());
        Ok((image, domain_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_select_known_model_and_domain() {
        let mut config = ImageDomainConfig::default();
        config
            .domains
            .insert("croton_ny".to_string(), "/data/domains/croton_ny".to_string());
        let (image, dir) = config.select("NWM", Some("croton_ny")).unwrap();
        assert_eq!(image, "registry:5000/nwm:latest");
        assert_eq!(dir, "/data/domains/croton_ny");
    }

    #[test]
    fn test_unknown_domain_falls_back_to_scratch() {
        let config = ImageDomainConfig::default();
        let (_, dir) = config.select("NWM", Some("nowhere")).unwrap();
        assert_eq!(dir, "/local");
    }

    #[test]
    fn test_unknown_model_is_an_error() {
        let config = ImageDomainConfig::default();
        assert!(config.select("XYZ", None).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"images": {{"NWM": "registry:5000/nwm:2.0"}},
                "domains": {{"croton_ny": "/data/croton"}}}}"#
        )
        .unwrap();
        let config = ImageDomainConfig::from_file(file.path()).unwrap();
        assert_eq!(config.images["NWM"], "registry:5000/nwm:2.0");
        assert_eq!(config.network, "mpi-net");
    }
}
