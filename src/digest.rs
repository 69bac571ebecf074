use std::{
    fmt,
    io::{self, Read},
};

use sha2::Digest as _;

/// Algorithm of a content digest.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub enum DigestAlgorithm {
    SHA256,
    SHA512,
}

impl DigestAlgorithm {
    /// Length of the hexadecimal value for this algorithm.
    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::SHA256 => 256 / 8 * 2,
            DigestAlgorithm::SHA512 => 512 / 8 * 2,
        }
    }
}

/// Content digest of a manifest or a layer blob, like `sha256:e3b0...`.
///
/// # Examples
///
/// ```
/// # use oci_kmods::*;
/// const VALUE: &str = "123456789012345678901234567890123456789012345678901234567890ABCD";
///
/// let digest = Digest::try_from(format!("sha256:{VALUE}")).unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), VALUE);
/// ```
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Digest {
    source: String,
    algorithm: DigestAlgorithm,
}

/// Errors from the digest parser.
#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Invalid digest algorithm.")]
    InvalidAlgorithm,

    #[error("Invalid digest value.")]
    InvalidValue,
}

impl Digest {
    /// The digest as it appears in a manifest (`algorithm:value`).
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hash_value(&self) -> &str {
        self.source
            .split_once(':')
            .map(|(_, h)| h)
            .unwrap_or_default()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Wrap `reader` to compute the digest of the data read from it.
    ///
    /// When `reader` reaches EOF, the computed digest is compared with
    /// this one. A mismatch is reported as an
    /// [`InvalidData`](::std::io::ErrorKind::InvalidData) error.
    pub fn wrap_reader<R: Read>(&self, reader: R) -> impl Read {
        let hasher: Box<dyn digest::DynDigest> = match self.algorithm {
            DigestAlgorithm::SHA256 => Box::new(sha2::Sha256::new()),
            DigestAlgorithm::SHA512 => Box::new(sha2::Sha512::new()),
        };

        VerifyingReader {
            hasher,
            expected: self.hash_value().to_ascii_lowercase(),
            reader,
            computed: None,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let (algorithm, value) = match source.split_once(':') {
            Some(("sha256", value)) => (DigestAlgorithm::SHA256, value),
            Some(("sha512", value)) => (DigestAlgorithm::SHA512, value),
            _ => return Err(DigestError::InvalidAlgorithm),
        };

        if value.len() != algorithm.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidValue);
        }

        Ok(Digest { source, algorithm })
    }
}

struct VerifyingReader<R> {
    hasher: Box<dyn digest::DynDigest>,
    expected: String,
    reader: R,

    /// Digest of the data, set when the inner reader reaches EOF.
    computed: Option<String>,
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.computed.is_some() {
            self.verify()?;
            return Ok(0);
        }

        let n = self.reader.read(buf)?;

        if n == 0 && !buf.is_empty() {
            self.verify()?;
            return Ok(0);
        }

        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<R> VerifyingReader<R> {
    fn verify(&mut self) -> io::Result<()> {
        let hasher = &mut self.hasher;
        let computed = self
            .computed
            .get_or_insert_with(|| HexString(hasher.finalize_reset()).to_string());

        if *computed == self.expected {
            return Ok(());
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Invalid digest. Expected {}, got {}.",
                self.expected, computed
            ),
        ))
    }
}

/// Encode a byte buffer as a lowercase hex string.
pub(crate) struct HexString<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

#[test]
fn encode_hex_bytes() {
    assert_eq!(HexString(b"\x01\x20\xf0").to_string(), "0120f0");
}

#[test]
fn parse_digests() {
    assert!(matches!(
        Digest::try_from("md5:0000".to_string()),
        Err(DigestError::InvalidAlgorithm)
    ));

    assert!(matches!(
        Digest::try_from("sha256".to_string()),
        Err(DigestError::InvalidAlgorithm)
    ));

    assert!(matches!(
        Digest::try_from(format!("sha256:{:064}", "x")),
        Err(DigestError::InvalidValue)
    ));

    assert!(matches!(
        Digest::try_from(format!("sha512:{:064}", 0)),
        Err(DigestError::InvalidValue)
    ));

    let digest = Digest::try_from(format!("sha512:{:0128}", 1)).unwrap();
    assert_eq!(digest.algorithm(), DigestAlgorithm::SHA512);
    assert_eq!(digest.hash_value(), format!("{:0128}", 1));
}

#[test]
fn verify_data_on_eof() {
    use std::io::Cursor;

    /// Digest for `abc`
    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    // Uppercase values in a manifest are still valid.
    let digest = Digest::try_from(format!("sha256:{}", DIGEST.to_uppercase())).unwrap();
    let mut output = Vec::new();

    digest
        .wrap_reader(Cursor::new("abc"))
        .read_to_end(&mut output)
        .unwrap();

    assert_eq!(output, b"abc");

    output.clear();
    let err = digest
        .wrap_reader(Cursor::new("abcx"))
        .read_to_end(&mut output)
        .unwrap_err();

    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    let msg = err.into_inner().unwrap().to_string();
    assert!(msg.contains(DIGEST));
    assert!(msg.contains("7571ce1f8e21c6b13dd7ec2c5ec7c9e4dd9852e209869511853f2f1f74b17927"));
}

#[test]
fn keep_result_after_eof() {
    use std::io::Cursor;

    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    let digest = Digest::try_from(format!("sha256:{DIGEST}")).unwrap();
    let mut buf = [0; 16];

    // Parsers like serde_json read past the end of the document, and the
    // caller drains the body again after it.
    let mut reader = digest.wrap_reader(Cursor::new("abc"));
    assert_eq!(reader.read(&mut buf).unwrap(), 3);
    for _ in 0..3 {
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    let mut reader = digest.wrap_reader(Cursor::new("abcx"));
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    for _ in 0..3 {
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains(DIGEST));
    }
}
