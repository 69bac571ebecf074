//! Find kernel modules in the layers of an OCI image.
//!
//! Layers are streamed from the registry, from the last applied layer to
//! the base one. The first `*.ko` file with a given name is extracted to a
//! local directory, and any file with the same name in a lower layer is
//! ignored, like a union mount would hide it.
//!
//! ```no_run
//! # use oci_kmods::*;
//! let credentials = DockerConfig::load()?;
//! let fetcher = Fetcher::new("quay.io/kmm/simple-kmod:v1").credentials(&credentials);
//!
//! let found = find_kmods(fetcher, "/tmp/kmods".as_ref(), &NoEventHandler)?;
//! for (name, path) in found.iter() {
//!     println!("{} -> {}", name.to_string_lossy(), path.display());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod credentials;
mod digest;
mod event_handler;
mod extract;
mod image;
mod kmods;
mod registry;
mod walker;

pub mod reference;

use std::path::Path;

pub use credentials::{Anonymous, CredentialSource, CredentialsError, DockerConfig};
pub use digest::{Digest, DigestAlgorithm, DigestError};
pub use event_handler::{EventHandler, NoEventHandler};
pub use extract::{read_entry_bytes, write_file, ExtractError};
pub use image::{FetchCause, FetchError, Fetcher, RemoteImage};
pub use kmods::{kmod_name, FoundSet, KmodCollector};
pub use reference::{MediaType, ParseError, Reference};
pub use registry::{HttpError, Transport};
pub use walker::{walk_files, Image, LayerEntry, Visitor, WalkError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Walk(#[from] WalkError),
}

/// Fetch the image described by `fetcher`, and extract its kernel modules
/// to `extraction_dir`.
///
/// `extraction_dir` must exist. Files written before an error are left
/// in place.
pub fn find_kmods<E: EventHandler>(
    fetcher: Fetcher,
    extraction_dir: &Path,
    event_handler: &E,
) -> Result<FoundSet, Error> {
    let image = fetcher.fetch(event_handler)?;
    search_image(&image, extraction_dir, event_handler)
}

/// Extract the kernel modules of an already opened image.
pub fn search_image<I, E>(
    image: &I,
    extraction_dir: &Path,
    event_handler: &E,
) -> Result<FoundSet, Error>
where
    I: Image + ?Sized,
    E: EventHandler,
{
    let mut collector = KmodCollector::new(extraction_dir, event_handler);
    walk_files(image, &mut collector, event_handler)?;

    let found = collector.into_found();
    event_handler.finished(found.len());

    Ok(found)
}
