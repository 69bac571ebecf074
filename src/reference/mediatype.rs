use std::{fmt, str::FromStr};

/// Media types of the registry objects this crate understands.
#[non_exhaustive]
#[derive(Copy, Clone, PartialEq, Debug, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum MediaType {
    DockerFsTarGzip,
    DockerForeignFsTarGzip,
    DockerImageV1,
    DockerManifestList,
    DockerManifestV2,
    OciConfig,
    OciFsTar,
    OciFsTarGzip,
    OciFsTarZstd,
    OciImageIndex,
    OciManifestV1,
}

/// Media type names, as found in `Content-Type` headers and in the
/// `mediaType` field of descriptors.
const NAMES: &[(MediaType, &str)] = &[
    (
        MediaType::DockerFsTarGzip,
        "application/vnd.docker.image.rootfs.diff.tar.gzip",
    ),
    (
        MediaType::DockerForeignFsTarGzip,
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
    ),
    (
        MediaType::DockerImageV1,
        "application/vnd.docker.container.image.v1+json",
    ),
    (
        MediaType::DockerManifestList,
        "application/vnd.docker.distribution.manifest.list.v2+json",
    ),
    (
        MediaType::DockerManifestV2,
        "application/vnd.docker.distribution.manifest.v2+json",
    ),
    (
        MediaType::OciConfig,
        "application/vnd.oci.image.config.v1+json",
    ),
    (MediaType::OciFsTar, "application/vnd.oci.image.layer.v1.tar"),
    (
        MediaType::OciFsTarGzip,
        "application/vnd.oci.image.layer.v1.tar+gzip",
    ),
    (
        MediaType::OciFsTarZstd,
        "application/vnd.oci.image.layer.v1.tar+zstd",
    ),
    (
        MediaType::OciImageIndex,
        "application/vnd.oci.image.index.v1+json",
    ),
    (
        MediaType::OciManifestV1,
        "application/vnd.oci.image.manifest.v1+json",
    ),
];

impl MediaType {
    /// Types accepted when a manifest is requested.
    pub(crate) const MANIFESTS: [MediaType; 4] = [
        MediaType::OciImageIndex,
        MediaType::OciManifestV1,
        MediaType::DockerManifestList,
        MediaType::DockerManifestV2,
    ];

    pub fn as_str(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(mt, _)| mt == self)
            .map_or("", |(_, name)| *name)
    }
}

/// Error from [`MediaType::from_str`].
#[derive(thiserror::Error, Debug)]
#[error("Unknown media type: {0}")]
pub struct InvalidMediaType(pub String);

impl FromStr for MediaType {
    type Err = InvalidMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Registries may append parameters, like `; charset=utf-8`.
        let name = s.split_once(';').map_or(s, |(m, _)| m).trim();

        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(mt, _)| *mt)
            .ok_or_else(|| InvalidMediaType(name.to_owned()))
    }
}

impl TryFrom<String> for MediaType {
    type Error = InvalidMediaType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn every_type_has_a_name() {
    for (mt, name) in NAMES {
        assert_eq!(mt.as_str(), *name);
        assert_eq!(name.parse::<MediaType>().ok(), Some(*mt));
    }

    assert_eq!(NAMES.len(), 11);
}

#[test]
fn parse_content_type_header() {
    assert_eq!(
        MediaType::from_str("application/vnd.docker.distribution.manifest.v2+json").ok(),
        Some(MediaType::DockerManifestV2)
    );

    assert_eq!(
        MediaType::from_str("Application/VND.oci.image.index.v1+json; charset=utf-8").ok(),
        Some(MediaType::OciImageIndex)
    );

    let err = MediaType::from_str("text/html; charset=utf-8").unwrap_err();
    assert_eq!(err.to_string(), "Unknown media type: text/html");
}

#[test]
fn media_type_in_json() {
    #[derive(serde::Deserialize, Debug)]
    struct Layer {
        #[serde(rename = "mediaType")]
        media_type: MediaType,
    }

    let layer: Layer =
        serde_json::from_str(r#"{"mediaType": "application/vnd.oci.image.layer.v1.tar+zstd"}"#)
            .unwrap();
    assert_eq!(layer.media_type, MediaType::OciFsTarZstd);

    let err = serde_json::from_str::<Layer>(r#"{"mediaType": "text/plain"}"#).unwrap_err();
    assert!(err.to_string().contains("text/plain"));
}
