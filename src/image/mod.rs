mod manifests;

use std::io::{self, BufReader, Read};

use crate::{
    credentials::{Anonymous, CredentialSource},
    reference::ParseError,
    registry::{Client, HttpError, Transport},
    walker::Image,
    EventHandler, MediaType, Reference,
};

use manifests::Blob;

/// Error returned when the image can't be fetched from the registry.
#[derive(thiserror::Error, Debug)]
#[error("Could not fetch image {reference}: {cause}")]
pub struct FetchError {
    /// Reference given to the [`Fetcher`].
    pub reference: String,

    #[source]
    pub cause: FetchCause,
}

/// Underlying cause of a [`FetchError`].
#[derive(thiserror::Error, Debug)]
pub enum FetchCause {
    #[error("Invalid reference: {0}")]
    Reference(#[from] ParseError),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] HttpError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or invalid Content-Type.")]
    MissingContentType,

    #[error("Invalid Content-Type: {0}")]
    InvalidContentType(MediaType),

    #[error("No image for the architecture.")]
    MissingArchitecture,

    #[error("Unsupported layer type: {0}")]
    UnsupportedLayer(MediaType),
}

/// Build the options to fetch an image.
///
/// # Examples
///
/// ```no_run
/// # use oci_kmods::*;
/// let credentials = DockerConfig::load()?;
/// let image = Fetcher::new("quay.io/kmm/simple-kmod:v1")
///     .skip_tls_verify(true)
///     .credentials(&credentials)
///     .fetch(&NoEventHandler)?;
///
/// println!("{} layers", image.layer_count());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Fetcher<'a> {
    reference: &'a str,
    transport: Transport,
    architecture: Option<&'a str>,
    os: Option<&'a str>,
    credentials: &'a dyn CredentialSource,
}

impl<'a> Fetcher<'a> {
    /// `reference` is parsed as described in [`Reference`].
    pub fn new(reference: &'a str) -> Self {
        Fetcher {
            reference,
            transport: Transport::default(),
            architecture: None,
            os: None,
            credentials: &Anonymous,
        }
    }

    /// Allow plain HTTP connections to the registry.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.transport.insecure = insecure;
        self
    }

    /// Accept any TLS certificate from the registry.
    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.transport.skip_tls_verify = skip;
        self
    }

    /// Architecture to select from an image index. The default is the
    /// architecture of the running system.
    pub fn architecture(mut self, architecture: &'a str) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Operating system to select from an image index. The default is
    /// the operating system of the running system.
    pub fn os(mut self, os: &'a str) -> Self {
        self.os = Some(os);
        self
    }

    pub fn credentials(mut self, credentials: &'a dyn CredentialSource) -> Self {
        self.credentials = credentials;
        self
    }

    /// Resolve the manifest of the image.
    ///
    /// Layers are not downloaded until they are read from the
    /// returned [`RemoteImage`].
    pub fn fetch<'e, E: EventHandler>(
        self,
        event_handler: &'e E,
    ) -> Result<RemoteImage<'e, E>, FetchError> {
        self.try_fetch(event_handler).map_err(|cause| FetchError {
            reference: self.reference.to_owned(),
            cause,
        })
    }

    fn try_fetch<'e, E: EventHandler>(
        &self,
        event_handler: &'e E,
    ) -> Result<RemoteImage<'e, E>, FetchCause> {
        let reference = Reference::try_from(self.reference)?;

        let client = Client::new(&reference, self.transport, self.credentials, event_handler)?;

        let manifest = manifests::get(&reference, self.architecture, self.os, &client)?;

        if let Some(layer) = manifest.layers.iter().find(|l| decoder_for(l).is_none()) {
            return Err(FetchCause::UnsupportedLayer(layer.media_type));
        }

        event_handler.image_fetched(
            self.reference,
            manifest.layers.len(),
            manifest.layers.iter().map(|l| l.size).sum(),
        );

        Ok(RemoteImage {
            client,
            layers: manifest.layers,
        })
    }
}

/// Image fetched from a registry.
///
/// Layers are streamed from the registry every time they are opened.
pub struct RemoteImage<'a, E> {
    client: Client<'a, E>,
    layers: Vec<Blob>,
}

impl<E: EventHandler> Image for RemoteImage<'_, E> {
    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn layer_id(&self, index: usize) -> &str {
        self.layers[index].digest.source()
    }

    fn open_layer(&self, index: usize) -> io::Result<Box<dyn Read + '_>> {
        let blob = &self.layers[index];

        let decoder = decoder_for(blob).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid media type: {}", blob.media_type),
            )
        })?;

        let archive = self
            .client
            .download_blob(&blob.digest)
            .map_err(io::Error::other)?;

        decoder(archive)
    }
}

type Decoder = fn(Box<dyn Read>) -> io::Result<Box<dyn Read>>;

/// Return the function to uncompress the archive of a layer.
fn decoder_for(blob: &Blob) -> Option<Decoder> {
    let decoder: Decoder = match blob.media_type {
        MediaType::DockerFsTarGzip
        | MediaType::DockerForeignFsTarGzip
        | MediaType::OciFsTarGzip => gzip_decoder,

        #[cfg(feature = "zstd")]
        MediaType::OciFsTarZstd => zstd_decoder,

        MediaType::OciFsTar => tar_reader,

        _ => return None,
    };

    Some(decoder)
}

fn gzip_decoder(archive: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
    Ok(Box::new(DrainAtEnd(flate2::read::GzDecoder::new(archive))))
}

#[cfg(feature = "zstd")]
fn zstd_decoder(archive: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
    let decoder = zstd::stream::read::Decoder::new(archive)?;
    Ok(Box::new(DrainAtEnd(decoder)))
}

/// Decoder that gives access to the stream it reads from.
trait CompressedSource: Read {
    fn source(&mut self) -> &mut dyn Read;
}

impl CompressedSource for flate2::read::GzDecoder<Box<dyn Read>> {
    fn source(&mut self) -> &mut dyn Read {
        self.get_mut()
    }
}

#[cfg(feature = "zstd")]
impl CompressedSource for zstd::stream::read::Decoder<'static, BufReader<Box<dyn Read>>> {
    fn source(&mut self) -> &mut dyn Read {
        self.get_mut()
    }
}

/// Read the source of a decoder to its EOF when the compressed stream
/// ends.
///
/// Decoders stop at the end of the stream, so the digest of the blob
/// would never be checked.
struct DrainAtEnd<D>(D);

impl<D: CompressedSource> Read for DrainAtEnd<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.read(buf)?;

        if n == 0 && !buf.is_empty() {
            io::copy(self.0.source(), &mut io::sink())?;
        }

        Ok(n)
    }
}

fn tar_reader(archive: Box<dyn Read>) -> io::Result<Box<dyn Read>> {
    Ok(Box::new(BufReader::new(archive)))
}

#[test]
fn drain_compressed_layers() {
    use std::{cell::Cell, io::Write, rc::Rc};

    /// Reader that tracks if EOF was reached.
    struct Source(&'static [u8], Rc<Cell<bool>>);

    impl Read for Source {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.0.read(buf)?;
            if n == 0 && !buf.is_empty() {
                self.1.set(true);
            }
            Ok(n)
        }
    }

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(b"content").unwrap();
    let mut data = encoder.finish().unwrap();

    // Bytes after the gzip member are not uncompressed, but still read.
    data.extend_from_slice(&[0; 4096]);
    let data: &'static [u8] = data.leak();

    let eof = Rc::new(Cell::new(false));
    let mut decoder = gzip_decoder(Box::new(Source(data, Rc::clone(&eof)))).unwrap();

    let mut output = Vec::new();
    decoder.read_to_end(&mut output).unwrap();

    assert_eq!(output, b"content");
    assert!(eof.get());
}
