//! Credentials to pull images from private registries.

use std::{
    collections::HashMap,
    env,
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use crate::reference::DEFAULT_REGISTRY;

/// Names used in configuration files for Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", DEFAULT_REGISTRY];

/// Source of credentials for a registry.
pub trait CredentialSource {
    /// Return the value for a `Basic` authorization to `registry`, already
    /// encoded as base64 (`user:password`).
    ///
    /// `None` means that requests are sent anonymously.
    fn basic_auth(&self, registry: &str) -> Option<String>;
}

/// Send all requests without credentials.
pub struct Anonymous;

impl CredentialSource for Anonymous {
    fn basic_auth(&self, _registry: &str) -> Option<String> {
        None
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialsError {
    #[error("Can't read {}: {1}", .0.display())]
    Io(PathBuf, io::Error),

    #[error("Invalid JSON in {}: {1}", .0.display())]
    Json(PathBuf, serde_json::Error),
}

/// Credentials from the `auths` table of the files written by
/// `docker login` or `podman login`.
#[derive(Debug, Default)]
pub struct DockerConfig {
    auths: HashMap<String, String>,
}

impl DockerConfig {
    /// Load the first configuration file found in:
    ///
    /// * `$DOCKER_CONFIG/config.json`
    /// * `$HOME/.docker/config.json`
    /// * `$REGISTRY_AUTH_FILE`
    /// * `$XDG_RUNTIME_DIR/containers/auth.json`
    ///
    /// If none of them exists, the instance is empty.
    pub fn load() -> Result<Self, CredentialsError> {
        let candidates = [
            env::var_os("DOCKER_CONFIG").map(|d| Path::new(&d).join("config.json")),
            env::var_os("HOME").map(|d| Path::new(&d).join(".docker/config.json")),
            env::var_os("REGISTRY_AUTH_FILE").map(PathBuf::from),
            env::var_os("XDG_RUNTIME_DIR").map(|d| Path::new(&d).join("containers/auth.json")),
        ];

        for path in candidates.into_iter().flatten() {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CredentialsError::Io(path, e)),
            };

            return Self::from_reader(BufReader::new(file))
                .map_err(|e| CredentialsError::Json(path, e));
        }

        Ok(Self::default())
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, serde_json::Error> {
        #[derive(serde::Deserialize, Debug)]
        struct Config {
            #[serde(default)]
            auths: HashMap<String, Entry>,
        }

        #[derive(serde::Deserialize, Debug)]
        struct Entry {
            auth: Option<String>,
        }

        let Config { auths } = serde_json::from_reader(reader)?;

        let auths = auths
            .into_iter()
            .filter_map(|(key, entry)| Some((registry_host(&key).to_owned(), entry.auth?)))
            .filter(|(_, auth)| !auth.is_empty())
            .collect();

        Ok(DockerConfig { auths })
    }
}

impl CredentialSource for DockerConfig {
    fn basic_auth(&self, registry: &str) -> Option<String> {
        if let Some(auth) = self.auths.get(registry) {
            return Some(auth.clone());
        }

        if DOCKER_HUB_ALIASES.contains(&registry) {
            return DOCKER_HUB_ALIASES
                .iter()
                .find_map(|alias| self.auths.get(*alias))
                .cloned();
        }

        None
    }
}

/// Extract the host from keys like `https://index.docker.io/v1/`.
fn registry_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);

    key.split_once('/').map_or(key, |(host, _)| host)
}

#[test]
fn read_docker_config() {
    let json = r#"
        {
          "auths": {
            "https://index.docker.io/v1/": { "auth": "aHViOnNlY3JldA==" },
            "quay.io": { "auth": "cXVheTpzZWNyZXQ=" },
            "http://127.0.0.1:5000/v2/": { "auth": "bG9jYWw6c2VjcmV0" },
            "ghcr.io": { "identitytoken": "abc" }
          },
          "credsStore": "desktop"
        }
    "#;

    let config = DockerConfig::from_reader(json.as_bytes()).unwrap();

    assert_eq!(config.basic_auth("quay.io").as_deref(), Some("cXVheTpzZWNyZXQ="));
    assert_eq!(
        config.basic_auth("127.0.0.1:5000").as_deref(),
        Some("bG9jYWw6c2VjcmV0")
    );
    assert_eq!(
        config.basic_auth(DEFAULT_REGISTRY).as_deref(),
        Some("aHViOnNlY3JldA==")
    );

    assert_eq!(config.basic_auth("ghcr.io"), None);
    assert_eq!(config.basic_auth("example.com"), None);
}

#[test]
fn empty_docker_config() {
    let config = DockerConfig::from_reader(&b"{}"[..]).unwrap();
    assert_eq!(config.basic_auth("quay.io"), None);

    let config = DockerConfig::from_reader(&br#"{"auths": {"quay.io": {}}}"#[..]).unwrap();
    assert_eq!(config.basic_auth("quay.io"), None);

    assert!(DockerConfig::from_reader(&br#"{"auths": 1}"#[..]).is_err());
    assert!(DockerConfig::from_reader(&b"not json"[..]).is_err());
}
