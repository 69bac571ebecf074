//! Visit the files of an image, from the top layer to the bottom one.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};

use crate::{extract::ExtractError, EventHandler};

/// Entry of a layer archive, as received by a [`Visitor`].
pub type LayerEntry<'a, 'r> = tar::Entry<'a, Box<dyn Read + 'r>>;

/// An image with its layers in storage order: the base layer is at
/// index `0`, and the last applied layer at `layer_count() - 1`.
pub trait Image {
    fn layer_count(&self) -> usize;

    /// Identifier of the layer at `index`, used in errors and events.
    fn layer_id(&self, index: usize) -> &str;

    /// Open the uncompressed tar stream of the layer at `index`.
    fn open_layer(&self, index: usize) -> io::Result<Box<dyn Read + '_>>;
}

/// Receives every entry of the layers.
pub trait Visitor {
    /// Called once per archive entry.
    ///
    /// `name` is the path of the entry as it appears in the archive.
    /// Data of the entry that is not read here is skipped before the
    /// next entry.
    fn visit(&mut self, name: &Path, entry: &mut LayerEntry<'_, '_>) -> Result<(), ExtractError>;
}

#[derive(thiserror::Error, Debug)]
pub enum WalkError {
    #[error("Could not get layer {layer}: {source}")]
    OpenLayer { layer: String, source: io::Error },

    #[error("Could not read the archive of layer {layer}: {source}")]
    Archive { layer: String, source: io::Error },

    #[error("Died processing file {} in layer {layer}: {source}", .entry.display())]
    Entry {
        layer: String,
        entry: PathBuf,
        source: ExtractError,
    },
}

impl WalkError {
    /// Layer where the error happened.
    pub fn layer(&self) -> &str {
        match self {
            WalkError::OpenLayer { layer, .. }
            | WalkError::Archive { layer, .. }
            | WalkError::Entry { layer, .. } => layer,
        }
    }
}

/// Send every entry in the layers of `image` to `visitor`.
///
/// Layers are visited from the last applied one to the base layer, so
/// a file in an upper layer is visited before any file with the same
/// path in a lower layer. The walk stops on the first error.
pub fn walk_files<I, V, E>(image: &I, visitor: &mut V, event_handler: &E) -> Result<(), WalkError>
where
    I: Image + ?Sized,
    V: Visitor + ?Sized,
    E: EventHandler,
{
    for index in (0..image.layer_count()).rev() {
        let layer = image.layer_id(index);
        event_handler.layer_start(index, layer);

        let archive_error = |source| WalkError::Archive {
            layer: layer.to_owned(),
            source,
        };

        let reader = image.open_layer(index).map_err(|source| WalkError::OpenLayer {
            layer: layer.to_owned(),
            source,
        })?;

        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            let name = entry.path().map_err(archive_error)?.into_owned();

            visitor
                .visit(&name, &mut entry)
                .map_err(|source| WalkError::Entry {
                    layer: layer.to_owned(),
                    entry: name,
                    source,
                })?;
        }

        // Read the data after the end-of-archive marker, so any check
        // done at EOF (like the blob digest) is applied.
        io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(archive_error)?;
    }

    Ok(())
}
