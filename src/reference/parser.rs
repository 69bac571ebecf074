//! Parse a reference to an image in an OCI registry.

use super::*;

/// Hostname to use when the reference is just the repository,
/// like `centos` or `nvidia/driver`.
pub(crate) const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const DEFAULT_NAMESPACE: &str = "library";

const DEFAULT_TAG: &str = "latest";

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference<'_>> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(ParseError::Empty);
    }

    // Digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Tag after the last `:`, unless it contains a `/`. In such case,
    // the `:` is the separator of the port in the registry address.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, tag),
        _ => (base, DEFAULT_TAG),
    };

    let (registry, repository) = match base.split_once('/') {
        None => (
            DEFAULT_REGISTRY,
            Repository::components(DEFAULT_NAMESPACE, base),
        ),

        Some((registry, repository)) if is_registry_host(registry) => {
            (registry, Repository::full(repository))
        }

        Some(_) => (DEFAULT_REGISTRY, Repository::full(base)),
    };

    if repository.name().is_empty() || tag.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    Ok(Reference {
        registry,
        repository,
        tag,
        digest,
    })
}

fn is_registry_host(component: &str) -> bool {
    component.contains(['.', ':']) || component == "localhost"
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repository:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    registry: $registry,
                    repository: $repository,
                    tag: $tag,
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!(
        "centos",
        [
            DEFAULT_REGISTRY,
            Repository::components("library", "centos"),
            DEFAULT_TAG,
            None
        ]
    );

    check!(
        "nvidia/driver:535",
        [
            DEFAULT_REGISTRY,
            Repository::full("nvidia/driver"),
            "535",
            None
        ]
    );

    check!(
        "localhost/kmm/kmod",
        [
            "localhost",
            Repository::full("kmm/kmod"),
            DEFAULT_TAG,
            None
        ]
    );

    check!(
        "registry:5000/kmm/kmod:v1",
        [
            "registry:5000",
            Repository::full("kmm/kmod"),
            "v1",
            None
        ]
    );

    check!(
        &format!("quay.io/kmm/kmod:1.2.3@sha256:{sha256}"),
        [
            "quay.io",
            Repository::full("kmm/kmod"),
            "1.2.3",
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );

    check!(
        &format!("example.com:1234/kmm/kmod@sha512:{sha512}"),
        [
            "example.com:1234",
            Repository::full("kmm/kmod"),
            DEFAULT_TAG,
            Digest::try_from(format!("sha512:{sha512}")).ok()
        ]
    );
}

#[test]
fn reject_invalid_references() {
    use crate::digest::DigestError;

    assert!(matches!(Reference::try_from(""), Err(ParseError::Empty)));
    assert!(matches!(Reference::try_from("  "), Err(ParseError::Empty)));

    assert!(matches!(
        Reference::try_from("quay.io/"),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(
        Reference::try_from("centos:"),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(
        Reference::try_from("centos:stream9@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        Reference::try_from("centos:stream9@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));
}

#[test]
fn display_reference() {
    let reference = Reference::try_from("centos").unwrap();
    assert_eq!(
        reference.to_string(),
        "registry-1.docker.io/library/centos:latest"
    );
    assert_eq!(reference.manifest_id(), "latest");
}
