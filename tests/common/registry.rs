use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use oci_kmods::MediaType;
use tiny_http::{Header, Request, Response, Server};

use super::blobs::Blob;

pub const ARCH: &str = "ARCH";

pub const OS: &str = "OS";

/// Registry server for a single image.
///
/// The tag is resolved to an image index, with a manifest for the
/// `ARCH`/`OS` platform, and an unrelated entry for another platform.
/// Both the index and the manifest can also be requested by digest.
pub struct TestRegistry {
    pub port: u16,
    repository: &'static str,
    tag: &'static str,
    index_digest: String,
    manifest_digest: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestRegistry {
    /// Start a registry server in a random port.
    pub fn start(repository: &'static str, tag: &'static str, layers: Vec<Blob>) -> TestRegistry {
        let server = Server::http("127.1:0").expect("start registry server");
        let port = server.server_addr().to_ip().unwrap().port();

        let requests = Arc::default();
        let registry = Registry::new(server, repository, tag, layers, Arc::clone(&requests));

        let index_digest = registry.index.reference();
        let manifest_digest = registry.manifest.reference();

        std::thread::spawn(move || registry.run());

        TestRegistry {
            port,
            repository,
            tag,
            index_digest,
            manifest_digest,
            requests,
        }
    }

    /// Digest of the image index, as `algorithm:value`.
    pub fn index_digest(&self) -> &str {
        &self.index_digest
    }

    /// Digest of the manifest for `ARCH`/`OS`, as `algorithm:value`.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Reference to pull the image by `digest`.
    pub fn reference_by_digest(&self, digest: &str) -> String {
        format!("127.0.0.1:{}/{}@{}", self.port, self.repository, digest)
    }

    /// Reference to pull the image.
    pub fn reference(&self) -> String {
        format!("127.0.0.1:{}/{}:{}", self.port, self.repository, self.tag)
    }

    /// Paths of the requests received by the server.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

struct Registry {
    server: Server,
    tag_path: String,
    manifests_prefix: String,
    blobs_prefix: String,
    index: Blob,
    manifest: Blob,
    blobs: Vec<Blob>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Registry {
    fn new(
        server: Server,
        repository: &'static str,
        tag: &'static str,
        layers: Vec<Blob>,
        requests: Arc<Mutex<Vec<String>>>,
    ) -> Registry {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Manifest<'a> {
            schema_version: u32,
            media_type: &'a str,
            config: &'a Blob,
            layers: &'a [Blob],
        }

        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Index<'a> {
            schema_version: u32,
            media_type: &'a str,
            manifests: [IndexItem<'a>; 2],
        }

        #[derive(serde::Serialize)]
        struct IndexItem<'a> {
            #[serde(flatten)]
            manifest: &'a Blob,
            platform: Platform<'a>,
        }

        #[derive(serde::Serialize)]
        struct Platform<'a> {
            architecture: &'a str,
            os: &'a str,
        }

        let config = Blob::new(MediaType::OciConfig, &br#"{"architecture": "ARCH"}"#[..]);

        let manifest = json_blob(
            MediaType::OciManifestV1,
            Manifest {
                schema_version: 2,
                media_type: MediaType::OciManifestV1.as_str(),
                config: &config,
                layers: &layers,
            },
        );

        // Manifest for a different platform. It is never requested.
        let other = json_blob(MediaType::OciManifestV1, "other platform");

        let index = json_blob(
            MediaType::OciImageIndex,
            Index {
                schema_version: 2,
                media_type: MediaType::OciImageIndex.as_str(),
                manifests: [
                    IndexItem {
                        manifest: &other,
                        platform: Platform {
                            architecture: "OTHER",
                            os: OS,
                        },
                    },
                    IndexItem {
                        manifest: &manifest,
                        platform: Platform {
                            architecture: ARCH,
                            os: OS,
                        },
                    },
                ],
            },
        );

        let mut blobs = layers;
        blobs.push(config);

        Registry {
            server,
            tag_path: format!("/v2/{repository}/manifests/{tag}"),
            manifests_prefix: format!("/v2/{repository}/manifests/sha256:"),
            blobs_prefix: format!("/v2/{repository}/blobs/sha256:"),
            index,
            manifest,
            blobs,
            requests,
        }
    }

    fn run(self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&self, request: Request) {
        let url = request.url().to_owned();
        self.requests.lock().unwrap().push(url.clone());

        if request.method() != &tiny_http::Method::Get {
            Self::not_found(request);
            return;
        }

        if url == self.tag_path {
            Self::send_blob(request, &self.index);
            return;
        }

        if let Some(digest) = url.strip_prefix(&self.manifests_prefix) {
            for manifest in [&self.index, &self.manifest] {
                if manifest.digest == digest {
                    Self::send_blob(request, manifest);
                    return;
                }
            }
        }

        if let Some(digest) = url.strip_prefix(&self.blobs_prefix) {
            if let Some(blob) = self.blobs.iter().find(|b| b.digest == digest) {
                Self::send_blob(request, blob);
                return;
            }
        }

        Self::not_found(request);
    }

    fn send_blob(request: Request, blob: &Blob) {
        let response = Response::from_data(blob.data.clone())
            .with_status_code(200)
            .with_header(Header::from_bytes("Content-Type", blob.media_type.as_str()).unwrap());

        let _ = request.respond(response);
    }

    fn not_found(request: Request) {
        let response = Response::from_string("not found").with_status_code(404);
        let _ = request.respond(response);
    }
}

fn json_blob(media_type: MediaType, body: impl serde::Serialize) -> Blob {
    Blob::new(media_type, serde_json::to_vec(&body).expect("Serialize JSON"))
}
