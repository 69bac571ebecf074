mod mediatype;
mod parser;

use std::fmt;

use crate::digest::Digest;

pub use mediatype::{InvalidMediaType, MediaType};

pub(crate) use parser::DEFAULT_REGISTRY;

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Empty image reference.")]
    Empty,

    #[error("Missing repository.")]
    MissingRepository,

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in an OCI registry.
///
/// The parser follows what `docker pull` does:
///
/// * If the first component of the reference is not a hostname (it has
///   no `.` nor `:`, and it is not `localhost`), the image is pulled
///   from Docker Hub. The namespace defaults to `library`. For example:
///
///   * `centos` is parsed as `registry-1.docker.io/library/centos`.
///   * `nvidia/driver` is parsed as `registry-1.docker.io/nvidia/driver`.
/// * The tag is the value after the last `:` character, or `latest`.
/// * A digest may follow a `@` character, but only SHA256 and SHA512.
///
/// # Examples
///
/// ```
/// # use oci_kmods::*;
/// const REFERENCE: &str = "quay.io/drivers/simple-kmod:v1.2@sha256:123456789012345678901234567890123456789012345678901234567890ABCD";
///
/// let reference = Reference::try_from(REFERENCE).unwrap();
/// assert_eq!(reference.registry, "quay.io");
/// assert_eq!(reference.repository.namespace(), Some("drivers"));
/// assert_eq!(reference.repository.name(), "simple-kmod");
/// assert_eq!(reference.tag, "v1.2");
///
/// let digest = reference.digest.as_ref().unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// ```
///
/// ```
/// # use oci_kmods::*;
/// let reference = Reference::try_from("centos:stream9").unwrap();
///
/// assert_eq!(reference.repository.to_string(), "library/centos");
/// assert_eq!(reference.tag, "stream9");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Reference<'a> {
    /// Address of the registry server.
    pub registry: &'a str,

    /// Repository name.
    pub repository: Repository<'a>,

    /// Image tag.
    pub tag: &'a str,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

impl<'a> Reference<'a> {
    /// Tag or digest to request the manifest of this image.
    ///
    /// The digest has precedence over the tag.
    pub fn manifest_id(&self) -> &str {
        match &self.digest {
            Some(d) => d.source(),
            None => self.tag,
        }
    }
}

impl fmt::Display for Reference<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}

/// Repository name, like `library/centos` or `nvidia/driver`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Repository<'a>(RepositoryInner<'a>);

impl<'a> Repository<'a> {
    pub(crate) fn components(namespace: &'a str, name: &'a str) -> Self {
        Repository(RepositoryInner::Components(namespace, name))
    }

    pub(crate) fn full(name: &'a str) -> Self {
        Repository(RepositoryInner::Full(name))
    }

    /// Last component of the repository.
    ///
    /// # Examples
    ///
    /// ```
    /// # use oci_kmods::*;
    /// let reference = Reference::try_from("example.com/a/b/driver:1").unwrap();
    /// assert_eq!(reference.repository.name(), "driver");
    /// ```
    pub fn name(&self) -> &str {
        match self.0 {
            RepositoryInner::Full(full) => full.rsplit_once('/').map(|s| s.1).unwrap_or(full),
            RepositoryInner::Components(_, name) => name,
        }
    }

    /// Everything before the last `/`, or `None` if the repository
    /// has a single component.
    ///
    /// # Examples
    ///
    /// ```
    /// # use oci_kmods::*;
    /// let reference = Reference::try_from("example.com/a/b/driver:1").unwrap();
    /// assert_eq!(reference.repository.namespace(), Some("a/b"));
    /// ```
    pub fn namespace(&self) -> Option<&str> {
        match self.0 {
            RepositoryInner::Full(full) => full.rsplit_once('/').map(|s| s.0),
            RepositoryInner::Components(ns, _) => Some(ns),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum RepositoryInner<'a> {
    /// Full repository name. Namespace is optional.
    Full(&'a str),

    /// Namespace and name.
    Components(&'a str, &'a str),
}

impl fmt::Display for Repository<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            RepositoryInner::Full(full) => f.write_str(full),
            RepositoryInner::Components(a, b) => write!(f, "{a}/{b}"),
        }
    }
}

impl<'a> TryFrom<&'a str> for Reference<'a> {
    type Error = ParseError;

    fn try_from(reference: &'a str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
