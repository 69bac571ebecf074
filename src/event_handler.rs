use std::{ffi::OsStr, path::Path};

/// Handler to receive notifications while an image is fetched and
/// searched.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler {
    /// HTTP request to the registry.
    fn registry_request(&self, url: &str) {}

    /// Registry requires an [authentication token][token].
    ///
    /// [token]: https://distribution.github.io/distribution/spec/auth/token/
    fn registry_auth(&self, url: &str) {}

    /// The manifest of the image was resolved.
    ///
    /// `layers` is the number of layers in the image, and `bytes` is
    /// the size of their compressed archives.
    fn image_fetched(&self, reference: &str, layers: usize, bytes: usize) {}

    /// Start to read a layer.
    ///
    /// `index` is the position of the layer in the manifest, so the
    /// first notification has the highest index.
    fn layer_start(&self, index: usize, layer: &str) {}

    /// A kernel module that was not seen in upper layers.
    fn kmod_found(&self, name: &OsStr, entry_path: &Path) {}

    /// A kernel module hidden by another one with the same name in an
    /// upper layer.
    fn kmod_shadowed(&self, name: &OsStr, entry_path: &Path) {}

    /// A kernel module was written to `destination`.
    fn kmod_extracted(&self, name: &OsStr, destination: &Path) {}

    /// The archive entry ended before its declared size.
    fn short_read(&self, entry_path: &Path, declared: u64, read: usize) {}

    /// All layers have been visited.
    fn finished(&self, kmods: usize) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
