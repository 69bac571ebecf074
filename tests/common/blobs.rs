use std::{cell::RefCell, io::Write, os::unix::ffi::OsStrExt, path::Path, rc::Rc};

use flate2::write::GzEncoder;
use oci_kmods::MediaType;
use serde::ser::SerializeStruct;
use sha2::{Digest, Sha256};

/// Blob served by the test registry.
#[derive(Clone, Debug)]
pub struct Blob {
    pub media_type: MediaType,

    /// Hex value of the SHA-256 digest, without the algorithm prefix.
    pub digest: String,

    pub data: Box<[u8]>,
}

/// Serialized as a descriptor, as found in manifests.
impl serde::Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("Blob", 3)?;
        s.serialize_field("mediaType", self.media_type.as_str())?;
        s.serialize_field("digest", &self.reference())?;
        s.serialize_field("size", &self.data.len())?;
        s.end()
    }
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Box<[u8]>>) -> Blob {
        let data = data.into();
        let digest = format!("{:x}", Sha256::digest(&data));

        Blob {
            media_type,
            digest,
            data,
        }
    }

    /// Digest as `algorithm:value`.
    pub fn reference(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Replace the data, but keep the digest of the original content.
    pub fn tampered(self, data: impl Into<Box<[u8]>>) -> Blob {
        Blob {
            data: data.into(),
            ..self
        }
    }

    /// Return a builder for a layer archive, compressed as described by
    /// `media_type`.
    pub fn layer(media_type: MediaType) -> LayerBuilder {
        let buffer = SharedBuffer::default();

        let stream: Box<dyn Write> = match media_type {
            MediaType::OciFsTarGzip | MediaType::DockerFsTarGzip => {
                Box::new(GzEncoder::new(buffer.clone(), Default::default()))
            }

            #[cfg(feature = "zstd")]
            MediaType::OciFsTarZstd => Box::new(
                zstd::stream::write::Encoder::new(buffer.clone(), 0)
                    .unwrap()
                    .auto_finish(),
            ),

            _ => Box::new(buffer.clone()),
        };

        LayerBuilder {
            media_type,
            buffer,
            archive: tar::Builder::new(stream),
        }
    }
}

pub struct LayerBuilder {
    media_type: MediaType,
    buffer: SharedBuffer,
    archive: tar::Builder<Box<dyn Write>>,
}

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LayerBuilder {
    pub fn build(mut self) -> Blob {
        self.archive.finish().unwrap();

        // Dropping the encoder writes the compressed trailer.
        drop(self.archive.into_inner().unwrap());

        Blob::new(self.media_type, self.buffer.0.take())
    }

    /// Tar archive before compression.
    pub fn build_tar(self) -> Vec<u8> {
        assert!(matches!(self.media_type, MediaType::OciFsTar));
        self.build().data.into()
    }

    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::dir());
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    pub fn regular(mut self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::file());
        header.set_size(data.len() as u64);
        set_raw_path(&mut header, path.as_ref());
        header.set_cksum();
        self.archive.append(&header, data).unwrap();
        self
    }

    pub fn symlink(mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o777);
        header.set_entry_type(tar::EntryType::symlink());
        header.set_size(0);
        self.archive.append_link(&mut header, path, target).unwrap();
        self
    }
}

/// Write `path` in the header without any normalization.
///
/// `Header::set_path` rejects absolute paths and removes `./`
/// components, but both are found in real images.
fn set_raw_path(header: &mut tar::Header, path: &Path) {
    let path = path.as_os_str().as_bytes();
    let name = &mut header.as_old_mut().name;

    assert!(path.len() < name.len(), "path too long for the test archive");

    name.fill(0);
    name[..path.len()].copy_from_slice(path);
}
