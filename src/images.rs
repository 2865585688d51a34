//! Image tag resolution.
//!
//! Informal tags are accepted on the command line: `4.0`, `neo4j:4.0`,
//! `latest`, or `file:/path/to/image.tar`. Clusters need the Enterprise
//! edition, so a clustered service gets `-enterprise` appended unless the
//! tag already names it.

use std::path::PathBuf;

use crate::error::ConfigError;

const REPOSITORY: &str = "neo4j";
const ENTERPRISE_SUFFIX: &str = "enterprise";

/// Where the image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A registry tag, pulled on demand.
    Tag(String),
    /// A saved image tarball that has to be loaded into the engine first.
    Archive(PathBuf),
}

pub fn resolve_image(image: &str, clustered: bool) -> Result<ImageSource, ConfigError> {
    let image = image.trim();
    if let Some(path) = image.strip_prefix("file:") {
        if path.is_empty() {
            return Err(ConfigError::InvalidImage(image.to_string()));
        }
        return Ok(ImageSource::Archive(PathBuf::from(path)));
    }
    if image.is_empty() || image.ends_with(':') {
        return Err(ConfigError::InvalidImage(image.to_string()));
    }

    let (repository, tag) = match image.rsplit_once(':') {
        // A colon inside a registry host (`host:5000/neo4j`) is not a tag.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ if image.contains('/') => (image.to_string(), "latest".to_string()),
        _ => (REPOSITORY.to_string(), image.to_string()),
    };

    let tag = if clustered && !tag.ends_with(ENTERPRISE_SUFFIX) {
        if tag == "latest" {
            ENTERPRISE_SUFFIX.to_string()
        } else {
            format!("{}-{}", tag, ENTERPRISE_SUFFIX)
        }
    } else {
        tag
    };
    Ok(ImageSource::Tag(format!("{}:{}", repository, tag)))
}
