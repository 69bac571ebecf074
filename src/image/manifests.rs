use std::{
    borrow::Cow,
    env::consts,
    io::{BufReader, Read},
    str::FromStr,
};

use crate::{digest::Digest, registry::Client, EventHandler, MediaType, Reference};

use super::FetchCause;

#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: usize,
}

#[derive(serde::Deserialize, Debug)]
pub(super) struct Manifest {
    pub layers: Vec<Blob>,
}

/// Download the manifest for the `reference`.
///
/// If the registry returns an image index, the manifest for the
/// `architecture`/`os` pair is requested. The defaults are the values
/// of the running system, translated to the names used in images.
///
/// Manifests requested by digest are verified.
pub(super) fn get<E: EventHandler>(
    reference: &Reference,
    architecture: Option<&str>,
    os: Option<&str>,
    http_client: &Client<E>,
) -> Result<Manifest, FetchCause> {
    let default_arch = match consts::ARCH {
        "aarch64" => "arm64",
        "x86" => "386",
        "x86_64" => "amd64",
        "powerpc64" => "ppc64le",
        other => other,
    };

    let architecture = architecture.unwrap_or(default_arch);
    let os = os.unwrap_or(consts::OS);

    let accept = MediaType::MANIFESTS.map(|mt| mt.as_str()).join(", ");

    let mut manifest_id = match &reference.digest {
        Some(d) => Cow::Borrowed(d),
        None => {
            let response =
                http_client.get(&format!("manifests/{}", reference.tag), Some(&accept))?;

            match parse_response(response, architecture, os, None)? {
                Resolved::Manifest(m) => return Ok(m),
                Resolved::Index(digest) => Cow::Owned(digest),
            }
        }
    };

    loop {
        let response = http_client.get(
            &format!("manifests/{}", manifest_id.source()),
            Some(&accept),
        )?;

        manifest_id = match parse_response(response, architecture, os, Some(&*manifest_id))? {
            Resolved::Manifest(m) => return Ok(m),
            Resolved::Index(digest) if digest != *manifest_id => Cow::Owned(digest),
            Resolved::Index(_) => return Err(FetchCause::MissingArchitecture),
        };
    }
}

enum Resolved {
    Manifest(Manifest),
    Index(Digest),
}

fn parse_response(
    response: ureq::Response,
    architecture: &str,
    os: &str,
    expected: Option<&Digest>,
) -> Result<Resolved, FetchCause> {
    let content_type = response
        .header("Content-Type")
        .and_then(|h| MediaType::from_str(h).ok())
        .ok_or(FetchCause::MissingContentType)?;

    let mut body: Box<dyn Read> = {
        let response = response.into_reader();
        match expected {
            Some(d) => Box::new(BufReader::new(d.wrap_reader(response))),
            None => Box::new(response),
        }
    };

    let resolved = match content_type {
        MediaType::DockerManifestList | MediaType::OciImageIndex => {
            Resolved::Index(parse_index(architecture, os, &mut body)?)
        }

        MediaType::DockerManifestV2 | MediaType::OciManifestV1 => {
            // https://distribution.github.io/distribution/spec/manifest-v2-2/
            Resolved::Manifest(serde_json::from_reader(&mut body)?)
        }

        unknown => return Err(FetchCause::InvalidContentType(unknown)),
    };

    // Consume the rest of the body, so the digest is checked.
    std::io::copy(&mut body, &mut std::io::sink())?;

    Ok(resolved)
}

/// Parse an image index to get the digest for the specified architecture and
/// operating system.
///
/// Refs:
///
/// * https://distribution.github.io/distribution/spec/manifest-v2-2/#manifest-list
/// * https://github.com/opencontainers/image-spec/blob/main/image-index.md
fn parse_index(
    architecture: &str,
    os: &str,
    response: &mut dyn Read,
) -> Result<Digest, FetchCause> {
    #[derive(serde::Deserialize, Debug)]
    struct List {
        manifests: Vec<Item>,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Item {
        digest: Digest,
        platform: Option<Platform>,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Platform {
        architecture: String,
        os: String,
    }

    let List { manifests } = serde_json::from_reader(response)?;

    manifests
        .into_iter()
        .find(|i| {
            i.platform
                .as_ref()
                .is_some_and(|p| p.architecture == architecture && p.os == os)
        })
        .map(|i| i.digest)
        .ok_or(FetchCause::MissingArchitecture)
}

#[test]
fn select_platform_from_index() {
    let index = r#"
        {
          "schemaVersion": 2,
          "mediaType": "application/vnd.oci.image.index.v1+json",
          "manifests": [
            {
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
              "size": 100,
              "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
              "size": 100,
              "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
            },
            {
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
              "size": 100,
              "annotations": { "vnd.docker.reference.type": "attestation-manifest" }
            }
          ]
        }
    "#;

    let digest = parse_index("arm64", "linux", &mut index.as_bytes()).unwrap();
    assert_eq!(digest.hash_value(), "2".repeat(64));

    assert!(matches!(
        parse_index("s390x", "linux", &mut index.as_bytes()),
        Err(FetchCause::MissingArchitecture)
    ));
}
