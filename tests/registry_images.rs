use std::{cell::RefCell, ffi::OsStr, fs, path::Path};

use oci_kmods::{find_kmods, Error, EventHandler, FetchCause, Fetcher, MediaType, WalkError};

mod common;

use common::{
    blobs::Blob,
    registry::{TestRegistry, ARCH, OS},
};

#[derive(Default)]
struct Recorder(RefCell<Vec<String>>);

impl Recorder {
    fn push(&self, event: String) {
        self.0.borrow_mut().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

impl EventHandler for Recorder {
    fn layer_start(&self, index: usize, _: &str) {
        self.push(format!("layer {index}"));
    }

    fn kmod_extracted(&self, name: &OsStr, _: &Path) {
        self.push(format!("extracted {}", name.to_string_lossy()));
    }

    fn kmod_shadowed(&self, _: &OsStr, entry_path: &Path) {
        self.push(format!("shadowed {}", entry_path.display()));
    }

    fn finished(&self, kmods: usize) {
        self.push(format!("finished {kmods}"));
    }
}

fn fetcher(reference: &str) -> Fetcher<'_> {
    Fetcher::new(reference).architecture(ARCH).os(OS)
}

#[test]
fn upper_layers_shadow_lower_ones() {
    let target = tempfile::tempdir().unwrap();

    let layers = vec![
        Blob::layer(MediaType::OciFsTarGzip)
            .directory("lib/modules/5.14/extra")
            .regular("lib/modules/5.14/extra/foo.ko", "base foo")
            .regular("lib/modules/bar.ko", "base bar")
            .regular("usr/bin/tool", "not a module")
            .build(),
        Blob::layer(MediaType::OciFsTar)
            .regular("./foo.ko", "middle foo")
            .regular("driver.ko.bak", "backup")
            .symlink("lib/modules/latest", "5.14")
            .build(),
        Blob::layer(MediaType::DockerFsTarGzip)
            .regular("/lib/modules/5.14/extra/foo.ko", "top foo")
            .regular("/lib/modules/5.14/extra/baz.ko", "top baz")
            .build(),
    ];

    let layer_digests: Vec<_> = layers.iter().map(|l| l.digest.clone()).collect();

    let registry = TestRegistry::start("kmm/kmods", "v1", layers);
    let reference = registry.reference();

    let events = Recorder::default();
    let found = find_kmods(fetcher(&reference), target.path(), &events).expect("find kmods");

    let names: Vec<_> = found.iter().map(|(n, _)| n.to_str().unwrap()).collect();
    assert_eq!(names, ["bar.ko", "baz.ko", "foo.ko"]);

    macro_rules! read {
        ($name:expr) => {
            fs::read_to_string(target.path().join($name)).expect($name)
        };
    }

    assert_eq!(read!("foo.ko"), "top foo");
    assert_eq!(read!("bar.ko"), "base bar");
    assert_eq!(read!("baz.ko"), "top baz");

    for missing in ["driver.ko.bak", "tool", "lib"] {
        assert!(!target.path().join(missing).exists(), "{missing}");
    }

    assert_eq!(found.get("foo.ko"), Some(target.path().join("foo.ko").as_path()));

    assert_eq!(
        events.events(),
        [
            "layer 2",
            "extracted foo.ko",
            "extracted baz.ko",
            "layer 1",
            "shadowed ./foo.ko",
            "layer 0",
            "shadowed lib/modules/5.14/extra/foo.ko",
            "extracted bar.ko",
            "finished 3",
        ]
    );

    // Each layer is downloaded once, and the config is never requested.
    let requests = registry.requests();
    for digest in &layer_digests {
        let n = requests.iter().filter(|r| r.ends_with(digest.as_str())).count();
        assert_eq!(n, 1, "requests for {digest}: {requests:?}");
    }

    assert_eq!(requests.len(), 2 + layer_digests.len(), "{requests:?}");
}

#[cfg(feature = "zstd")]
#[test]
fn zstd_layers() {
    let target = tempfile::tempdir().unwrap();

    let layers = vec![
        Blob::layer(MediaType::OciFsTar)
            .regular("lib/modules/foo.ko", "plain")
            .build(),
        Blob::layer(MediaType::OciFsTarZstd)
            .regular("lib/modules/foo.ko", "zstd")
            .build(),
    ];

    let registry = TestRegistry::start("kmm/kmods", "zstd", layers);
    let reference = registry.reference();

    let found = find_kmods(fetcher(&reference), target.path(), &Recorder::default()).unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(fs::read(target.path().join("foo.ko")).unwrap(), b"zstd");
}

#[test]
fn image_without_kmods() {
    let target = tempfile::tempdir().unwrap();

    let layers = vec![Blob::layer(MediaType::OciFsTarGzip)
        .regular("etc/os-release", "ID=test")
        .regular("lib/modules/foo.ko.xz", "compressed")
        .build()];

    let registry = TestRegistry::start("kmm/empty", "latest", layers);
    let reference = registry.reference();

    let found = find_kmods(fetcher(&reference), target.path(), &Recorder::default()).unwrap();

    assert!(found.is_empty());
    assert!(fs::read_dir(target.path()).unwrap().next().is_none());
}

#[test]
fn corrupt_layer() {
    let target = tempfile::tempdir().unwrap();

    let layers = vec![
        Blob::new(MediaType::OciFsTarGzip, &b"this is not a gzip stream"[..]),
        Blob::layer(MediaType::OciFsTar)
            .regular("foo.ko", "top")
            .build(),
    ];

    let bad_layer = layers[0].reference();

    let registry = TestRegistry::start("kmm/corrupt", "v1", layers);
    let reference = registry.reference();

    let err = find_kmods(fetcher(&reference), target.path(), &Recorder::default()).unwrap_err();

    let err = match err {
        Error::Walk(err) => err,
        err => panic!("unexpected error: {err}"),
    };

    assert_eq!(err.layer(), bad_layer);
    assert!(matches!(err, WalkError::Archive { .. }));

    // Modules from upper layers are kept.
    assert_eq!(fs::read(target.path().join("foo.ko")).unwrap(), b"top");
}

#[test]
fn reject_layers_with_invalid_digest() {
    let mut media_types = vec![
        MediaType::OciFsTar,
        MediaType::OciFsTarGzip,
        MediaType::DockerFsTarGzip,
    ];

    if cfg!(feature = "zstd") {
        media_types.push(MediaType::OciFsTarZstd);
    }

    for media_type in media_types {
        let target = tempfile::tempdir().unwrap();

        let replacement = Blob::layer(media_type)
            .regular("evil.ko", "replaced")
            .build();

        let layer = Blob::layer(media_type)
            .regular("good.ko", "original")
            .build()
            .tampered(replacement.data);

        let registry = TestRegistry::start("kmm/tampered", "v1", vec![layer]);
        let reference = registry.reference();

        let err = find_kmods(fetcher(&reference), target.path(), &Recorder::default())
            .expect_err(media_type.as_str());

        assert!(
            matches!(err, Error::Walk(WalkError::Archive { .. })),
            "{media_type}: {err}"
        );
    }
}

#[test]
fn reject_trailing_data_in_gzip_layers() {
    let target = tempfile::tempdir().unwrap();

    let layer = Blob::layer(MediaType::OciFsTarGzip)
        .regular("foo.ko", "foo")
        .build();

    // The gzip stream is still valid. Only the digest can detect the
    // extra bytes.
    let mut data = layer.data.to_vec();
    data.extend_from_slice(b"extra bytes after the gzip member");
    let layer = layer.tampered(data);

    let registry = TestRegistry::start("kmm/trailing", "v1", vec![layer]);
    let reference = registry.reference();

    let err = find_kmods(fetcher(&reference), target.path(), &Recorder::default()).unwrap_err();
    assert!(matches!(err, Error::Walk(WalkError::Archive { .. })), "{err}");
}

#[test]
fn pull_by_digest() {
    let layers = vec![Blob::layer(MediaType::OciFsTarGzip)
        .regular("lib/modules/foo.ko", "foo")
        .build()];

    let registry = TestRegistry::start("kmm/pinned", "v1", layers);

    for digest in [registry.index_digest(), registry.manifest_digest()] {
        let target = tempfile::tempdir().unwrap();
        let reference = registry.reference_by_digest(digest);

        let found = find_kmods(fetcher(&reference), target.path(), &Recorder::default())
            .unwrap_or_else(|e| panic!("{reference}: {e}"));

        assert_eq!(found.len(), 1);
        assert_eq!(fs::read(target.path().join("foo.ko")).unwrap(), b"foo");
    }

    // The tag is never requested.
    let tag_requests = registry
        .requests()
        .into_iter()
        .filter(|r| r.ends_with("/manifests/v1"))
        .count();

    assert_eq!(tag_requests, 0);
}

#[test]
fn missing_platform() {
    let target = tempfile::tempdir().unwrap();

    let registry = TestRegistry::start("kmm/kmods", "v1", vec![]);
    let reference = registry.reference();

    let fetcher = Fetcher::new(&reference).architecture("s390x").os(OS);
    let err = find_kmods(fetcher, target.path(), &Recorder::default()).unwrap_err();

    let err = match err {
        Error::Fetch(err) => err,
        err => panic!("unexpected error: {err}"),
    };

    assert_eq!(err.reference, reference);
    assert!(matches!(err.cause, FetchCause::MissingArchitecture));
    assert!(err.to_string().starts_with("Could not fetch image"));
}

#[test]
fn missing_tag() {
    let target = tempfile::tempdir().unwrap();

    let registry = TestRegistry::start("kmm/kmods", "v1", vec![]);
    let reference = format!("127.0.0.1:{}/kmm/kmods:v2", registry.port);

    let err = find_kmods(fetcher(&reference), target.path(), &Recorder::default()).unwrap_err();

    assert!(
        matches!(&err, Error::Fetch(e) if matches!(e.cause, FetchCause::HttpRequest(_))),
        "{err}"
    );
}
