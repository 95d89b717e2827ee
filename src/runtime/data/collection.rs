//! Keyed set of data objects, e.g. the tiles of one matrix.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::object::DataObject;
use super::{DataKey, DirectoryError};
use crate::runtime::device::{DeviceIndex, DeviceRegistry};

/// Owns the [`DataObject`]s of one distributed collection.
///
/// Objects are created the first time a key is asked for. Dropping the
/// collection tears them down; every copy should have been released by then.
#[derive(Debug)]
pub struct DataCollection {
    name: String,
    tile_size: usize,
    devices: Arc<DeviceRegistry>,
    objects: Mutex<HashMap<DataKey, Arc<DataObject>>>,
}

impl DataCollection {
    pub fn new(
        name: impl Into<String>,
        tile_size: usize,
        devices: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            tile_size,
            devices,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes per datum.
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// Directory record for `key`, created on first use.
    pub fn data_of(
        &self,
        key: DataKey,
    ) -> Result<Arc<DataObject>, DirectoryError> {
        let mut objects = self.objects.lock();
        if let Some(object) = objects.get(&key) {
            return Ok(Arc::clone(object));
        }
        let object = DataObject::new(key, self.tile_size, Arc::clone(&self.devices))?;
        objects.insert(key, Arc::clone(&object));
        debug!(collection = %self.name, %key, "data object created");
        Ok(object)
    }

    /// Existing record for `key`.
    pub fn get(
        &self,
        key: DataKey,
    ) -> Option<Arc<DataObject>> {
        self.objects.lock().get(&key).cloned()
    }

    /// Seed `key` with `bytes` on `device`, which becomes the owner.
    pub fn insert_tile(
        &self,
        key: DataKey,
        device: DeviceIndex,
        bytes: &[u8],
    ) -> Result<Arc<DataObject>, DirectoryError> {
        if bytes.len() != self.tile_size {
            return Err(DirectoryError::SizeMismatch {
                expected: self.tile_size,
                actual: bytes.len(),
            });
        }
        let object = self.data_of(key)?;
        let copy = object.acquire_for_write(device)?;
        copy.bytes_mut()?.copy_from_slice(bytes);
        Ok(object)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<DataKey> {
        let mut keys: Vec<_> = self.objects.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl Drop for DataCollection {
    fn drop(&mut self) {
        let objects = self.objects.get_mut();
        let leaked: usize = objects.values().map(|object| object.active_refs()).sum();
        if leaked > 0 {
            warn!(
                collection = %self.name,
                leaked,
                "collection dropped while copies are still referenced"
            );
        }
        objects.clear();
    }
}
