//! Search kernel modules (`*.ko` files) in the layers of an image.

use std::{
    collections::{btree_map, BTreeMap},
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::{
    extract::{read_entry_bytes, write_file, ExtractError},
    walker::{LayerEntry, Visitor},
    EventHandler,
};

/// Suffix of kernel module files.
const KMOD_SUFFIX: &[u8] = b".ko";

/// Return the name used to identify a kernel module in `entry_path`, or
/// `None` if it is not a kernel module.
///
/// The name is the last component of the path, so `/lib/modules/foo.ko`,
/// `lib/modules/foo.ko` and `./foo.ko` are the same module.
///
/// # Examples
///
/// ```
/// # use oci_kmods::kmod_name;
/// # use std::{ffi::OsStr, path::Path};
/// assert_eq!(kmod_name(Path::new("./lib/modules/foo.ko")), Some(OsStr::new("foo.ko")));
/// assert_eq!(kmod_name(Path::new("foo.ko.xz")), None);
/// ```
pub fn kmod_name(entry_path: &Path) -> Option<&OsStr> {
    if !entry_path.as_os_str().as_bytes().ends_with(KMOD_SUFFIX) {
        return None;
    }

    entry_path.file_name()
}

/// Kernel modules extracted from an image, indexed by their names.
#[derive(Debug, Default)]
pub struct FoundSet {
    kmods: BTreeMap<OsString, PathBuf>,
}

impl FoundSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, if it is not already in the set.
    ///
    /// `materialize` is called with `path` only when `name` is new, and
    /// `name` is added only if `materialize` succeeds. Returns `true` if
    /// `name` was added.
    pub fn insert_with<F, E>(
        &mut self,
        name: &OsStr,
        path: PathBuf,
        materialize: F,
    ) -> Result<bool, E>
    where
        F: FnOnce(&Path) -> Result<(), E>,
    {
        match self.kmods.entry(name.to_owned()) {
            btree_map::Entry::Occupied(_) => Ok(false),

            btree_map::Entry::Vacant(slot) => {
                materialize(&path)?;
                slot.insert(path);
                Ok(true)
            }
        }
    }

    /// Local path of the kernel module `name`.
    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&Path> {
        self.kmods.get(name.as_ref()).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.kmods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kmods.is_empty()
    }

    /// Pairs of name and local path, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &Path)> {
        self.kmods.iter().map(|(n, p)| (n.as_os_str(), p.as_path()))
    }

    /// Local paths of the kernel modules, sorted by name.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.kmods.values().map(PathBuf::as_path)
    }
}

/// [`Visitor`] to extract the first instance of every kernel module to
/// a directory.
///
/// Since layers are visited from the top, a module found in a lower
/// layer with the same name as an extracted one is ignored.
pub struct KmodCollector<'a, E> {
    extraction_dir: PathBuf,
    found: FoundSet,
    event_handler: &'a E,
}

impl<'a, E: EventHandler> KmodCollector<'a, E> {
    /// Modules are written directly in `extraction_dir`, which must
    /// already exist.
    pub fn new(extraction_dir: impl Into<PathBuf>, event_handler: &'a E) -> Self {
        KmodCollector {
            extraction_dir: extraction_dir.into(),
            found: FoundSet::new(),
            event_handler,
        }
    }

    pub fn into_found(self) -> FoundSet {
        self.found
    }
}

impl<E: EventHandler> Visitor for KmodCollector<'_, E> {
    fn visit(&mut self, name: &Path, entry: &mut LayerEntry<'_, '_>) -> Result<(), ExtractError> {
        let Some(kmod) = kmod_name(name) else {
            return Ok(());
        };

        let event_handler = self.event_handler;
        let destination = self.extraction_dir.join(kmod);

        let extract = |destination: &Path| -> Result<(), ExtractError> {
            event_handler.kmod_found(kmod, name);

            let declared = entry.size();
            let contents = read_entry_bytes(declared, entry)?;

            if contents.len() as u64 != declared {
                event_handler.short_read(name, declared, contents.len());
            }

            write_file(destination, &contents)?;
            event_handler.kmod_extracted(kmod, destination);

            Ok(())
        };

        let added = self.found.insert_with(kmod, destination, extract)?;

        if !added {
            event_handler.kmod_shadowed(kmod, name);
        }

        Ok(())
    }
}

#[test]
fn match_kmod_names() {
    let name = |p: &'static str| kmod_name(Path::new(p)).and_then(OsStr::to_str);

    assert_eq!(name("/lib/modules/5.14/extra/foo.ko"), Some("foo.ko"));
    assert_eq!(name("lib/modules/foo.ko"), Some("foo.ko"));
    assert_eq!(name("./foo.ko"), Some("foo.ko"));
    assert_eq!(name("foo.ko"), Some("foo.ko"));
    assert_eq!(name(".ko"), Some(".ko"));
    assert_eq!(name("a/.ko"), Some(".ko"));

    assert_eq!(name("driver.ko.bak"), None);
    assert_eq!(name("driver.ko.xz"), None);
    assert_eq!(name("driver.KO"), None);
    assert_eq!(name("lib/modules/"), None);
    assert_eq!(name("dir.ko/"), None);
    assert_eq!(name("ko"), None);
    assert_eq!(name("k"), None);
    assert_eq!(name(""), None);
}

#[test]
fn insert_only_first_name() {
    let mut found = FoundSet::new();
    let mut calls = 0;

    let added = found
        .insert_with(OsStr::new("foo.ko"), "/x/foo.ko".into(), |_| {
            calls += 1;
            Ok::<_, ()>(())
        })
        .unwrap();
    assert!(added);

    let added = found
        .insert_with(OsStr::new("foo.ko"), "/y/foo.ko".into(), |_| {
            calls += 1;
            Ok::<_, ()>(())
        })
        .unwrap();
    assert!(!added);

    assert_eq!(calls, 1);
    assert_eq!(found.len(), 1);
    assert_eq!(found.get("foo.ko"), Some(Path::new("/x/foo.ko")));
}

#[test]
fn failed_materialization_is_not_recorded() {
    let mut found = FoundSet::new();

    let result = found.insert_with(OsStr::new("foo.ko"), "/x/foo.ko".into(), |_| {
        Err("disk full")
    });
    assert_eq!(result, Err("disk full"));
    assert!(found.is_empty());

    // The name can be claimed again.
    let result = found.insert_with(OsStr::new("foo.ko"), "/x/foo.ko".into(), |_| {
        Ok::<_, ()>(())
    });
    assert_eq!(result, Ok(true));
    assert_eq!(found.paths().collect::<Vec<_>>(), [Path::new("/x/foo.ko")]);
}
