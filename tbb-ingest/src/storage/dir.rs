//! Directory-tree storage backend.
//!
//! ```text
//! <dir>/<name>.tbb/
//!   attributes.json
//!   Station001/
//!     attributes.json
//!     001000005.i16      raw little-endian samples
//!     001000005.json     array attributes
//! ```
//!
//! Arrays grow with `set_len` and are written with positioned writes, so
//! out-of-order frames land directly at their offset. Attributes are held in
//! memory and each changed sidecar is written once, when its array or the
//! output is closed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{
    ArrayId, AttrValue, Attributes, GroupId, Node, Storage, StorageError, StorageFactory,
    check_bounds,
};

const OUTPUT_SUFFIX: &str = "tbb";
const ATTRIBUTES_FILE: &str = "attributes.json";
const SAMPLE_BYTES: u64 = 2;

/// Attributes plus the sidecar they belong in.
struct Sidecar {
    path: PathBuf,
    attributes: Attributes,
    dirty: bool,
}

impl Sidecar {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            attributes: Attributes::new(),
            dirty: true,
        }
    }

    fn set(&mut self, name: &str, value: AttrValue) {
        self.attributes.insert(name.to_owned(), value);
        self.dirty = true;
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if self.dirty {
            write_sidecar(&self.path, &self.attributes)?;
            self.dirty = false;
        }
        Ok(())
    }
}

struct DirGroup {
    path: PathBuf,
    sidecar: Sidecar,
}

struct DirArray {
    file: Option<File>,
    len: u64,
    sidecar: Sidecar,
}

impl DirArray {
    fn file(&self) -> Result<&File, StorageError> {
        self.file.as_ref().ok_or(StorageError::Closed)
    }
}

/// An output backed by a directory of raw sample files.
pub struct DirStorage {
    root: PathBuf,
    sidecar: Sidecar,
    groups: Vec<DirGroup>,
    arrays: Vec<DirArray>,
    scratch: Vec<u8>,
}

impl DirStorage {
    /// Creates `path` (must not exist) and returns an empty output in it.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if the directory exists, or I/O failure.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = path.into();
        if let Err(e) = fs::create_dir(&root) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(StorageError::AlreadyExists(root.display().to_string()));
            }
            return Err(e.into());
        }
        Ok(Self {
            sidecar: Sidecar::new(root.join(ATTRIBUTES_FILE)),
            root,
            groups: Vec::new(),
            arrays: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Directory holding this output.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn group(&self, group: GroupId) -> Result<&DirGroup, StorageError> {
        self.groups
            .get(group.index())
            .ok_or(StorageError::UnknownGroup(group))
    }

    fn array(&self, array: ArrayId) -> Result<&DirArray, StorageError> {
        self.arrays
            .get(array.index())
            .ok_or(StorageError::UnknownArray(array))
    }

    fn array_mut(&mut self, array: ArrayId) -> Result<&mut DirArray, StorageError> {
        self.arrays
            .get_mut(array.index())
            .ok_or(StorageError::UnknownArray(array))
    }

    fn flush_sidecars(&mut self) -> Result<(), StorageError> {
        self.sidecar.flush()?;
        for group in &mut self.groups {
            group.sidecar.flush()?;
        }
        for array in &mut self.arrays {
            array.sidecar.flush()?;
        }
        Ok(())
    }
}

impl Drop for DirStorage {
    fn drop(&mut self) {
        // Best effort for outputs abandoned without `close`.
        let _ = self.flush_sidecars();
    }
}

fn write_sidecar(path: &Path, attributes: &Attributes) -> Result<(), StorageError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, attributes)?;
    writer.flush()?;
    Ok(())
}

/// Reads a JSON attribute sidecar back, e.g. for inspection tools and tests.
///
/// # Errors
///
/// I/O or decode failure.
pub fn read_sidecar(path: &Path) -> Result<Attributes, StorageError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Reads an array file back as samples.
///
/// # Errors
///
/// I/O failure.
pub fn read_samples(path: &Path) -> Result<Vec<i16>, StorageError> {
    let bytes = fs::read(path)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

impl Storage for DirStorage {
    fn create_group(&mut self, name: &str) -> Result<GroupId, StorageError> {
        let path = self.root.join(name);
        if let Err(e) = fs::create_dir(&path) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(StorageError::DuplicateName(name.to_owned()));
            }
            return Err(e.into());
        }
        self.groups.push(DirGroup {
            sidecar: Sidecar::new(path.join(ATTRIBUTES_FILE)),
            path,
        });
        Ok(GroupId::new(self.groups.len() - 1))
    }

    fn create_array(
        &mut self,
        group: GroupId,
        name: &str,
        _chunk: usize,
    ) -> Result<ArrayId, StorageError> {
        let data_path = self.group(group)?.path.join(format!("{name}.i16"));
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::DuplicateName(name.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        self.arrays.push(DirArray {
            file: Some(file),
            len: 0,
            sidecar: Sidecar::new(data_path.with_extension("json")),
        });
        Ok(ArrayId::new(self.arrays.len() - 1))
    }

    fn extend_array(&mut self, array: ArrayId, new_len: u64) -> Result<(), StorageError> {
        let entry = self.array_mut(array)?;
        if new_len > entry.len {
            entry.file()?.set_len(new_len * SAMPLE_BYTES)?;
            entry.len = new_len;
        }
        Ok(())
    }

    fn write_at(&mut self, array: ArrayId, offset: u64, data: &[i16]) -> Result<(), StorageError> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(data.iter().flat_map(|s| s.to_le_bytes()));

        let result = self.array(array).and_then(|entry| {
            check_bounds(offset, data.len(), entry.len)?;
            entry.file()?.write_all_at(&scratch, offset * SAMPLE_BYTES)?;
            Ok(())
        });
        self.scratch = scratch;
        result
    }

    fn array_len(&self, array: ArrayId) -> Result<u64, StorageError> {
        Ok(self.array(array)?.len)
    }

    fn set_attribute(
        &mut self,
        node: Node,
        name: &str,
        value: AttrValue,
    ) -> Result<(), StorageError> {
        let sidecar = match node {
            Node::Root => &mut self.sidecar,
            Node::Group(group) => {
                &mut self
                    .groups
                    .get_mut(group.index())
                    .ok_or(StorageError::UnknownGroup(group))?
                    .sidecar
            }
            Node::Array(array) => &mut self.array_mut(array)?.sidecar,
        };
        sidecar.set(name, value);
        Ok(())
    }

    fn attribute(&self, node: Node, name: &str) -> Result<Option<AttrValue>, StorageError> {
        let attributes = match node {
            Node::Root => &self.sidecar.attributes,
            Node::Group(group) => &self.group(group)?.sidecar.attributes,
            Node::Array(array) => &self.array(array)?.sidecar.attributes,
        };
        Ok(attributes.get(name).cloned())
    }

    fn close_array(&mut self, array: ArrayId) -> Result<(), StorageError> {
        let entry = self.array_mut(array)?;
        entry.sidecar.flush()?;
        if let Some(file) = entry.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        for index in 0..self.arrays.len() {
            self.close_array(ArrayId::new(index))?;
        }
        self.flush_sidecars()
    }
}

/// Creates `<dir>/<name>.tbb` outputs.
#[derive(Debug, Clone)]
pub struct DirFactory {
    dir: PathBuf,
}

impl DirFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory an output called `name` would occupy.
    #[must_use]
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{OUTPUT_SUFFIX}"))
    }
}

impl StorageFactory for DirFactory {
    type Output = DirStorage;

    fn exists(&self, name: &str) -> bool {
        self.output_path(name).exists()
    }

    fn create(&self, name: &str) -> Result<DirStorage, StorageError> {
        DirStorage::create(self.output_path(name)).map_err(|e| match e {
            StorageError::AlreadyExists(_) => StorageError::AlreadyExists(name.to_owned()),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = DirFactory::new(tmp.path());

        let mut storage = factory.create("obs").unwrap();
        assert!(factory.exists("obs"));
        assert!(matches!(factory.create("obs"), Err(StorageError::AlreadyExists(_))));

        let group = storage.create_group("Station007").unwrap();
        let array = storage.create_array(group, "007003021", 5000).unwrap();
        storage.set_attribute(Node::Root, "TELESCOPE", "LOFAR".into()).unwrap();
        storage.set_attribute(Node::Array(array), "RCU_ID", AttrValue::UInt(21)).unwrap();

        storage.extend_array(array, 6).unwrap();
        storage.write_at(array, 4, &[-1, 2]).unwrap();
        storage.write_at(array, 0, &[3]).unwrap();
        storage.close().unwrap();

        let root = factory.output_path("obs");
        let samples = read_samples(&root.join("Station007/007003021.i16")).unwrap();
        assert_eq!(samples, vec![3, 0, 0, 0, -1, 2]);

        let root_attrs = read_sidecar(&root.join(ATTRIBUTES_FILE)).unwrap();
        assert_eq!(root_attrs.get("TELESCOPE"), Some(&AttrValue::Text("LOFAR".into())));

        let array_attrs = read_sidecar(&root.join("Station007/007003021.json")).unwrap();
        assert_eq!(array_attrs.get("RCU_ID"), Some(&AttrValue::UInt(21)));
    }

    #[test]
    fn sidecars_are_written_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::create(tmp.path().join("z.tbb")).unwrap();
        let group = storage.create_group("Station001").unwrap();
        let array = storage.create_array(group, "001000000", 16).unwrap();
        for i in 0..16u64 {
            storage
                .set_attribute(Node::Array(array), &format!("KEY_{i}"), AttrValue::UInt(i))
                .unwrap();
        }
        storage.set_attribute(Node::Group(group), "STATION_ID", AttrValue::UInt(1)).unwrap();

        let root = storage.path().to_path_buf();
        let array_sidecar = root.join("Station001/001000000.json");
        assert!(!array_sidecar.exists());
        assert!(!root.join(ATTRIBUTES_FILE).exists());
        assert_eq!(
            storage.attribute(Node::Array(array), "KEY_15").unwrap(),
            Some(AttrValue::UInt(15))
        );

        storage.close_array(array).unwrap();
        assert_eq!(read_sidecar(&array_sidecar).unwrap().len(), 16);
        assert!(!root.join("Station001").join(ATTRIBUTES_FILE).exists());

        storage.close().unwrap();
        let group_attrs = read_sidecar(&root.join("Station001").join(ATTRIBUTES_FILE)).unwrap();
        assert_eq!(group_attrs.get("STATION_ID"), Some(&AttrValue::UInt(1)));
        assert!(read_sidecar(&root.join(ATTRIBUTES_FILE)).unwrap().is_empty());
    }

    #[test]
    fn writes_after_close_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::create(tmp.path().join("x.tbb")).unwrap();
        let group = storage.create_group("g").unwrap();
        let array = storage.create_array(group, "a", 16).unwrap();
        storage.extend_array(array, 2).unwrap();
        storage.close_array(array).unwrap();

        assert!(matches!(storage.write_at(array, 0, &[1]), Err(StorageError::Closed)));
        assert_eq!(storage.array_len(array).unwrap(), 2);
    }

    #[test]
    fn out_of_bounds_write() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::create(tmp.path().join("y.tbb")).unwrap();
        let group = storage.create_group("g").unwrap();
        let array = storage.create_array(group, "a", 16).unwrap();

        assert!(matches!(
            storage.write_at(array, 0, &[1]),
            Err(StorageError::OutOfBounds { len: 0, .. })
        ));
    }
}
