//! Copy the data of archive entries to local files.

use std::{
    fs::{DirBuilder, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

/// Mode for the directories created to hold extracted files.
const DIR_MODE: u32 = 0o770;

/// Mode for new extracted files.
const FILE_MODE: u32 = 0o700;

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Could not read from tar: {0}")]
    Read(#[source] io::Error),

    #[error("Declared size is too large: {0} bytes.")]
    TooLarge(u64),

    #[error("Could not create directory structure for {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Could not write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Read up to `size` bytes from `reader`.
///
/// `reader` is read until the buffer is full or it reaches EOF, so short
/// reads are accepted. If EOF comes before `size` bytes, the returned
/// buffer is shorter than `size`.
pub fn read_entry_bytes<R>(size: u64, reader: &mut R) -> Result<Vec<u8>, ExtractError>
where
    R: Read + ?Sized,
{
    let len = usize::try_from(size).map_err(|_| ExtractError::TooLarge(size))?;

    let mut contents = vec![0; len];
    let mut filled = 0;

    while filled < len {
        match reader.read(&mut contents[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::Read(e)),
        }
    }

    contents.truncate(filled);
    Ok(contents)
}

/// Write `contents` to `destination`, replacing any existing file.
///
/// Missing parent directories are created.
pub fn write_file(destination: &Path, contents: &[u8]) -> Result<(), ExtractError> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(parent)
            .map_err(|source| ExtractError::CreateDir {
                path: destination.to_owned(),
                source,
            })?;
    }

    let write_error = |source| ExtractError::Write {
        path: destination.to_owned(),
        source,
    };

    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(destination)
        .map_err(write_error)?;

    output.write_all(contents).map_err(write_error)?;

    Ok(())
}

#[cfg(test)]
struct ShortReader<'a> {
    data: &'a [u8],
    interrupt: bool,
}

#[cfg(test)]
impl Read for ShortReader<'_> {
    /// Return a single byte on every call, with an `Interrupted`
    /// error before each of them if `interrupt` is set.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.interrupt {
            self.interrupt = false;
            return Err(io::ErrorKind::Interrupted.into());
        }

        let Some((first, tail)) = self.data.split_first() else {
            return Ok(0);
        };

        buf[0] = *first;
        self.data = tail;
        self.interrupt = true;
        Ok(1)
    }
}

#[test]
fn accept_short_reads() {
    let mut reader = ShortReader {
        data: b"\x7fELF kernel module",
        interrupt: false,
    };

    let contents = read_entry_bytes(18, &mut reader).unwrap();
    assert_eq!(contents, b"\x7fELF kernel module");
}

#[test]
fn truncate_on_early_eof() {
    let contents = read_entry_bytes(100, &mut &b"0123"[..]).unwrap();
    assert_eq!(contents, b"0123");

    // Data after the declared size is not consumed.
    let mut reader = &b"0123456789"[..];
    assert_eq!(read_entry_bytes(4, &mut reader).unwrap(), b"0123");
    assert_eq!(reader, b"456789");

    assert!(read_entry_bytes(0, &mut reader).unwrap().is_empty());
}

#[test]
fn report_read_errors() {
    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("connection reset"))
        }
    }

    let err = read_entry_bytes(10, &mut Broken).unwrap_err();
    assert!(matches!(err, ExtractError::Read(_)));
    assert!(err.to_string().contains("Could not read from tar"));
}

#[test]
fn create_parents_and_replace() {
    use std::os::unix::fs::PermissionsExt;

    let target = tempfile::tempdir().unwrap();
    let destination = target.path().join("a/b/foo.ko");

    write_file(&destination, b"first version").unwrap();
    write_file(&destination, b"second").unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), b"second");

    let mode = std::fs::metadata(&destination).unwrap().permissions().mode();
    assert_eq!(mode & 0o077, 0);
}

#[test]
fn report_destination_in_errors() {
    let target = tempfile::tempdir().unwrap();

    // A regular file where the parent directory should be.
    let blocker = target.path().join("file");
    std::fs::write(&blocker, "").unwrap();

    let destination = blocker.join("foo.ko");
    let err = write_file(&destination, b"data").unwrap_err();

    assert!(matches!(&err, ExtractError::CreateDir { path, .. } if *path == destination));
    assert!(err.to_string().contains("file/foo.ko"));

    // Destination is a directory.
    let err = write_file(target.path(), b"data").unwrap_err();
    assert!(matches!(&err, ExtractError::Write { path, .. } if path == target.path()));
}
