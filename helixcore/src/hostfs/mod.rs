//! Virtual file store.
//!
//! Path-keyed byte blobs with synchronous-at-the-caller reads/writes. The
//! in-memory map is authoritative; a `Backing` implementation may persist
//! writes durably, but its failures never block the read path — a write
//! always lands in the in-memory map first, and persistence happens
//! best-effort after.

use std::collections::BTreeMap;

/// Seeded read-only paths and their fixed content.
const SEEDED_FILES: &[(&str, &str)] = &[
    ("/proc/version", "Linux 4.5 blink-1.0 x86_64 GNU/Linux\n"),
    ("/proc/cpuinfo", "model name : Blink x86-64 Virtual CPU\n"),
    ("/etc/hostname", "helixcore\n"),
    (
        "/etc/os-release",
        "NAME=\"HelixCore OS\"\nVERSION=\"0.1\"\n",
    ),
];

/// A durable backing store a `FileStore` may persist writes to. Failures are
/// logged and otherwise ignored — they never propagate to the caller of
/// `FileStore::write`.
pub trait Backing {
    fn persist(&mut self, path: &str, bytes: &[u8]);
    fn remove(&mut self, path: &str);
}

/// A `Backing` that does nothing; the default for runs that don't need
/// persistence across process restarts.
#[derive(Default)]
pub struct NullBacking;

impl Backing for NullBacking {
    fn persist(&mut self, _path: &str, _bytes: &[u8]) {}
    fn remove(&mut self, _path: &str) {}
}

/// One entry returned by `list`: a path's first component past the queried
/// prefix, and whether further `/`-separated components follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
}

/// The in-memory authoritative map of path -> bytes, with an optional
/// durable backing layer.
pub struct FileStore<B: Backing = NullBacking> {
    files: BTreeMap<String, Vec<u8>>,
    backing: B,
}

impl FileStore<NullBacking> {
    /// A store seeded with the fixed read-only paths and no
    /// durable backing.
    pub fn new() -> Self {
        Self::with_backing(NullBacking)
    }
}

impl Default for FileStore<NullBacking> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backing> FileStore<B> {
    pub fn with_backing(backing: B) -> Self {
        let mut files = BTreeMap::new();
        for (path, contents) in SEEDED_FILES {
            files.insert((*path).to_string(), contents.as_bytes().to_vec());
        }
        Self { files, backing }
    }

    /// `read(path) -> bytes | none`.
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    /// `write(path, bytes)`. Always lands in the in-memory map immediately;
    /// persistence to `backing` is fire-and-forget.
    pub fn write(&mut self, path: &str, bytes: Vec<u8>) {
        self.backing.persist(path, &bytes);
        self.files.insert(path.to_string(), bytes);
    }

    /// Overwrites `len` bytes of `path` starting at `offset`, extending the
    /// file if the write runs past its current end. Returns the number of
    /// bytes written. Used by the host adapter's `write` syscall when the
    /// target fd is a regular file.
    pub fn write_at(&mut self, path: &str, offset: usize, data: &[u8]) -> usize {
        let file = self.files.entry(path.to_string()).or_default();
        let end = offset + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(data);
        self.backing.persist(path, file);
        data.len()
    }

    /// `delete(path)`.
    pub fn delete(&mut self, path: &str) {
        self.backing.remove(path);
        self.files.remove(path);
    }

    /// `list(dir) -> [(name, is_dir)]`. Directory semantics are synthesized:
    /// returns, for every key whose path has `dir/` as a prefix, the first
    /// path component after that prefix and whether more `/`s follow.
    pub fn list(&self, dir: &str) -> Vec<ListEntry> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };
        let mut seen = std::collections::BTreeSet::new();
        let mut entries = Vec::new();
        for key in self.files.keys() {
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let (name, is_dir) = match rest.find('/') {
                Some(idx) => (&rest[..idx], true),
                None => (rest, false),
            };
            if seen.insert(name.to_string()) {
                entries.push(ListEntry {
                    name: name.to_string(),
                    is_dir,
                });
            }
        }
        entries
    }

    /// Byte length of `path`, for `stat`/`fstat`.
    pub fn size(&self, path: &str) -> Option<usize> {
        self.files.get(path).map(Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_fixed_paths() {
        let store = FileStore::new();
        assert_eq!(
            store.read("/proc/version"),
            Some("Linux 4.5 blink-1.0 x86_64 GNU/Linux\n".as_bytes())
        );
        assert_eq!(store.read("/etc/hostname").unwrap(), b"helixcore\n");
    }

    #[test]
    fn write_then_read_reflects_in_memory() {
        let mut store = FileStore::new();
        store.write("/tmp/a.txt", b"hello".to_vec());
        assert_eq!(store.read("/tmp/a.txt"), Some(b"hello".as_slice()));
    }

    #[test]
    fn list_synthesizes_directory_entries() {
        let mut store = FileStore::new();
        store.write("/src/main.c", b"x".to_vec());
        store.write("/src/lib/helper.c", b"y".to_vec());
        let mut entries = store.list("/src");
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                ListEntry {
                    name: "lib".into(),
                    is_dir: true
                },
                ListEntry {
                    name: "main.c".into(),
                    is_dir: false
                },
            ]
        );
    }

    #[test]
    fn write_at_extends_file() {
        let mut store = FileStore::new();
        store.write("/f", b"abc".to_vec());
        let n = store.write_at("/f", 1, b"XY");
        assert_eq!(n, 2);
        assert_eq!(store.read("/f"), Some(b"aXY".as_slice()));
        store.write_at("/f", 5, b"Z");
        assert_eq!(store.read("/f"), Some(b"aXY\0\0Z".as_slice()));
    }

    #[test]
    fn delete_removes_entry() {
        let mut store = FileStore::new();
        store.write("/tmp/a", b"1".to_vec());
        store.delete("/tmp/a");
        assert_eq!(store.read("/tmp/a"), None);
    }
}
