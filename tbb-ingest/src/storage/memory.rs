//! In-process storage backend.
//!
//! Outputs live in a tree shared between the factory and the writer, so a
//! test or a dry run can inspect what a session produced after it ended.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    ArrayId, AttrValue, Attributes, GroupId, Node, Storage, StorageError, StorageFactory,
    check_bounds,
};

/// One channel array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryArray {
    pub data: Vec<i16>,
    pub chunk: usize,
    pub attributes: Attributes,
    pub closed: bool,
}

/// One station group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryGroup {
    pub attributes: Attributes,
    pub arrays: BTreeMap<String, MemoryArray>,
}

/// A complete output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryOutput {
    pub attributes: Attributes,
    pub groups: BTreeMap<String, MemoryGroup>,
    pub closed: bool,
}

impl MemoryOutput {
    /// Looks up an array by group and array name.
    #[must_use]
    pub fn array(&self, group: &str, array: &str) -> Option<&MemoryArray> {
        self.groups.get(group)?.arrays.get(array)
    }

    /// Number of arrays across all groups.
    #[must_use]
    pub fn array_count(&self) -> usize {
        self.groups.values().map(|g| g.arrays.len()).sum()
    }
}

/// Largest array the memory backend will allocate, in samples (512 MiB).
pub const MAX_ARRAY_SAMPLES: u64 = 1 << 28;

type SharedOutput = Arc<Mutex<MemoryOutput>>;

fn lock(output: &SharedOutput) -> MutexGuard<'_, MemoryOutput> {
    output.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writer half of a memory output.
#[derive(Debug)]
pub struct MemoryStorage {
    output: SharedOutput,
    groups: Vec<String>,
    arrays: Vec<(String, String)>,
}

impl MemoryStorage {
    /// A standalone output not registered with any factory.
    #[must_use]
    pub fn new() -> Self {
        Self::attach(Arc::default())
    }

    fn attach(output: SharedOutput) -> Self {
        Self {
            output,
            groups: Vec::new(),
            arrays: Vec::new(),
        }
    }

    /// Copy of the current tree.
    #[must_use]
    pub fn snapshot(&self) -> MemoryOutput {
        lock(&self.output).clone()
    }

    fn group_name(&self, group: GroupId) -> Result<&str, StorageError> {
        self.groups
            .get(group.index())
            .map(String::as_str)
            .ok_or(StorageError::UnknownGroup(group))
    }

    fn array_path(&self, array: ArrayId) -> Result<&(String, String), StorageError> {
        self.arrays
            .get(array.index())
            .ok_or(StorageError::UnknownArray(array))
    }

    fn with_array<R>(
        &self,
        array: ArrayId,
        f: impl FnOnce(&mut MemoryArray) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let (group, name) = self.array_path(array)?;
        let mut output = lock(&self.output);
        let entry = output
            .groups
            .get_mut(group)
            .and_then(|g| g.arrays.get_mut(name))
            .ok_or(StorageError::UnknownArray(array))?;
        f(entry)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn create_group(&mut self, name: &str) -> Result<GroupId, StorageError> {
        let mut output = lock(&self.output);
        if output.groups.contains_key(name) {
            return Err(StorageError::DuplicateName(name.to_owned()));
        }
        output.groups.insert(name.to_owned(), MemoryGroup::default());
        drop(output);

        self.groups.push(name.to_owned());
        Ok(GroupId::new(self.groups.len() - 1))
    }

    fn create_array(
        &mut self,
        group: GroupId,
        name: &str,
        chunk: usize,
    ) -> Result<ArrayId, StorageError> {
        let group_name = self.group_name(group)?.to_owned();
        let mut output = lock(&self.output);
        let arrays = &mut output
            .groups
            .get_mut(&group_name)
            .ok_or(StorageError::UnknownGroup(group))?
            .arrays;
        if arrays.contains_key(name) {
            return Err(StorageError::DuplicateName(format!("{group_name}/{name}")));
        }
        arrays.insert(
            name.to_owned(),
            MemoryArray {
                chunk,
                ..MemoryArray::default()
            },
        );
        drop(output);

        self.arrays.push((group_name, name.to_owned()));
        Ok(ArrayId::new(self.arrays.len() - 1))
    }

    fn extend_array(&mut self, array: ArrayId, new_len: u64) -> Result<(), StorageError> {
        self.with_array(array, |a| {
            if a.closed {
                return Err(StorageError::Closed);
            }
            if new_len > MAX_ARRAY_SAMPLES {
                return Err(StorageError::TooLarge {
                    requested: new_len,
                    limit: MAX_ARRAY_SAMPLES,
                });
            }
            let new_len = usize::try_from(new_len).map_err(|_| StorageError::TooLarge {
                requested: new_len,
                limit: MAX_ARRAY_SAMPLES,
            })?;
            if new_len > a.data.len() {
                a.data.resize(new_len, 0);
            }
            Ok(())
        })
    }

    fn write_at(&mut self, array: ArrayId, offset: u64, data: &[i16]) -> Result<(), StorageError> {
        self.with_array(array, |a| {
            if a.closed {
                return Err(StorageError::Closed);
            }
            check_bounds(offset, data.len(), a.data.len() as u64)?;
            let start = offset as usize;
            a.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn array_len(&self, array: ArrayId) -> Result<u64, StorageError> {
        self.with_array(array, |a| Ok(a.data.len() as u64))
    }

    fn set_attribute(
        &mut self,
        node: Node,
        name: &str,
        value: AttrValue,
    ) -> Result<(), StorageError> {
        match node {
            Node::Root => {
                lock(&self.output).attributes.insert(name.to_owned(), value);
                Ok(())
            }
            Node::Group(group) => {
                let group_name = self.group_name(group)?;
                let mut output = lock(&self.output);
                output
                    .groups
                    .get_mut(group_name)
                    .ok_or(StorageError::UnknownGroup(group))?
                    .attributes
                    .insert(name.to_owned(), value);
                Ok(())
            }
            Node::Array(array) => self.with_array(array, |a| {
                a.attributes.insert(name.to_owned(), value);
                Ok(())
            }),
        }
    }

    fn attribute(&self, node: Node, name: &str) -> Result<Option<AttrValue>, StorageError> {
        match node {
            Node::Root => Ok(lock(&self.output).attributes.get(name).cloned()),
            Node::Group(group) => {
                let group_name = self.group_name(group)?;
                let output = lock(&self.output);
                let entry = output
                    .groups
                    .get(group_name)
                    .ok_or(StorageError::UnknownGroup(group))?;
                Ok(entry.attributes.get(name).cloned())
            }
            Node::Array(array) => self.with_array(array, |a| Ok(a.attributes.get(name).cloned())),
        }
    }

    fn close_array(&mut self, array: ArrayId) -> Result<(), StorageError> {
        self.with_array(array, |a| {
            a.closed = true;
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let mut output = lock(&self.output);
        for group in output.groups.values_mut() {
            for array in group.arrays.values_mut() {
                array.closed = true;
            }
        }
        output.closed = true;
        Ok(())
    }
}

/// Hands out memory outputs and keeps them for later inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    outputs: Arc<Mutex<BTreeMap<String, SharedOutput>>>,
}

impl MemoryFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all outputs created so far, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    /// Copy of the named output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<MemoryOutput> {
        self.registry().get(name).map(|o| lock(o).clone())
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, SharedOutput>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageFactory for MemoryFactory {
    type Output = MemoryStorage;

    fn exists(&self, name: &str) -> bool {
        self.registry().contains_key(name)
    }

    fn create(&self, name: &str) -> Result<MemoryStorage, StorageError> {
        let mut outputs = self.registry();
        if outputs.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_owned()));
        }
        let output = SharedOutput::default();
        outputs.insert(name.to_owned(), Arc::clone(&output));
        Ok(MemoryStorage::attach(output))
    }
}
