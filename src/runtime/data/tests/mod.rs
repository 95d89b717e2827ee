//! Coherency directory 单元测试
//!
//! 测试数据副本的状态机、传输和所有权转移

use std::sync::Arc;
use std::thread;

use crate::runtime::data::{
    AccessMode, CoherencyState, CopyRef, DataCollection, DataKey, DataObject, DirectoryError,
    LocalTransport, ReadAccess, TransferHandle, TransferRequest, TransferStatus,
};
use crate::runtime::device::{DeviceIndex, DeviceRegistry};
use crate::runtime::memory::BufferAllocator;

const HOST: DeviceIndex = DeviceIndex(0);
const ACCEL: DeviceIndex = DeviceIndex(1);
const TILE: usize = 64;

fn registry() -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::host_with_accelerators(2, 1 << 20).unwrap())
}

fn object() -> Arc<DataObject> {
    DataObject::new(DataKey(7), TILE, registry()).unwrap()
}

/// Owner on `device` at `version`, one write per step.
fn owned_at(
    object: &Arc<DataObject>,
    device: DeviceIndex,
    version: u32,
) {
    for _ in 0..version {
        let copy = object.acquire_for_write(device).unwrap();
        copy.bytes_mut().unwrap().fill(version as u8);
    }
}

fn started(access: ReadAccess) -> TransferHandle {
    match access {
        ReadAccess::Pending(TransferRequest::Started(handle)) => handle,
        other => panic!("expected a started transfer, got {:?}", other),
    }
}

fn ready(access: ReadAccess) -> CopyRef {
    match access {
        ReadAccess::Ready(copy) => copy,
        other => panic!("expected a ready copy, got {:?}", other),
    }
}

#[cfg(test)]
mod copy_table_tests {
    use super::*;

    #[test]
    fn test_get_or_create_copy_starts_invalid() {
        let object = object();
        let copy = object.get_or_create_copy(ACCEL).unwrap();

        assert_eq!(copy.device(), ACCEL);
        assert_eq!(copy.coherency(), CoherencyState::Invalid);
        assert_eq!(copy.transfer_status(), TransferStatus::NotTransferred);
        assert_eq!(copy.version(), 0);
        assert!(!copy.has_buffer());
        assert_eq!(object.copy_count(), 1);
    }

    #[test]
    fn test_get_or_create_copy_returns_same_copy() {
        let object = object();
        let a = object.get_or_create_copy(HOST).unwrap();
        let b = object.get_or_create_copy(HOST).unwrap();

        assert!(Arc::ptr_eq(a.arc(), b.arc()));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(object.copy_count(), 1);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let object = object();
        assert_eq!(
            object.get_or_create_copy(DeviceIndex(9)).unwrap_err(),
            DirectoryError::UnknownDevice(DeviceIndex(9))
        );
    }

    #[test]
    fn test_unused_invalid_copy_is_released() {
        let object = object();
        let copy = object.get_or_create_copy(ACCEL).unwrap();
        copy.release();
        assert_eq!(object.copy_count(), 0);
        assert!(object.copy(ACCEL).is_none());
    }

    #[test]
    fn test_preferred_device_is_advisory() {
        let object = object();
        assert_eq!(object.preferred_device(), None);
        object.set_preferred_device(Some(ACCEL));
        assert_eq!(object.preferred_device(), Some(ACCEL));
        assert_eq!(object.owner_device(), None);
    }
}

#[cfg(test)]
mod coherency_tests {
    use super::*;

    #[test]
    fn test_read_from_owner_shares_at_owner_version() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 5);

        let handle = started(object.acquire_for_read(ACCEL).unwrap());
        assert_eq!(handle.target().coherency(), CoherencyState::Invalid);
        assert_eq!(
            handle.target().transfer_status(),
            TransferStatus::UnderTransfer
        );
        assert_eq!(handle.source().device(), HOST);
        transport.execute(handle).unwrap();

        let reader = ready(object.acquire_for_read(ACCEL).unwrap());
        assert_eq!(reader.coherency(), CoherencyState::Shared);
        assert_eq!(reader.transfer_status(), TransferStatus::TransferComplete);
        assert_eq!(reader.version(), 5);
        assert_eq!(reader.reader_count(), 1);
        assert!(reader.is_reader());
        assert_eq!(&*reader.bytes().unwrap(), &[5u8; TILE][..]);

        let owner = object.copy(HOST).unwrap();
        assert_eq!(owner.coherency(), CoherencyState::Owned);
        assert_eq!(owner.version(), 5);
        assert_eq!(object.owner_device(), Some(HOST));
        assert_eq!(transport.stats().bytes_moved, TILE as u64);
    }

    #[test]
    fn test_write_invalidates_previous_owner() {
        let object = object();
        owned_at(&object, HOST, 5);
        let old = object.copy(HOST).unwrap();

        let writer = object.acquire_for_write(ACCEL).unwrap();

        assert_eq!(old.coherency(), CoherencyState::Invalid);
        assert_eq!(writer.coherency(), CoherencyState::Owned);
        assert_eq!(writer.version(), 6);
        assert_eq!(object.version(), 6);
        assert_eq!(object.owner_device(), Some(ACCEL));
        assert!(!object.is_current(&old));
    }

    #[test]
    fn test_owner_read_takes_no_reader_slot() {
        let object = object();
        owned_at(&object, HOST, 1);

        let copy = ready(object.acquire_for_read(HOST).unwrap());
        assert_eq!(copy.coherency(), CoherencyState::Owned);
        assert!(!copy.is_reader());
        assert_eq!(copy.reader_count(), 0);
    }

    #[test]
    fn test_duplicate_transfer_is_in_flight() {
        let object = object();
        owned_at(&object, HOST, 1);

        let first = started(object.acquire_for_read(ACCEL).unwrap());
        match object.acquire_for_read(ACCEL).unwrap() {
            ReadAccess::Pending(request) => assert!(request.is_in_flight()),
            other => panic!("expected pending, got {:?}", other),
        }

        let source = object.copy(HOST).unwrap();
        let request = object
            .begin_transfer(first.target(), &source, AccessMode::Read)
            .unwrap();
        assert!(request.is_in_flight());
        first.complete();
    }

    #[test]
    fn test_abandoned_transfer_resets_target() {
        let object = object();
        owned_at(&object, HOST, 1);

        let handle = started(object.acquire_for_read(ACCEL).unwrap());
        let target = handle.target().clone();
        drop(handle);

        assert_eq!(target.coherency(), CoherencyState::Invalid);
        assert_eq!(target.transfer_status(), TransferStatus::NotTransferred);
        let retry = started(object.acquire_for_read(ACCEL).unwrap());
        retry.complete();
    }

    #[test]
    fn test_readers_block_promotion_and_invalidation() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();

        let reader = ready(object.acquire_for_read(ACCEL).unwrap());
        assert_eq!(
            object.acquire_for_write(ACCEL).unwrap_err(),
            DirectoryError::ReadersActive {
                device: ACCEL,
                readers: 1
            }
        );
        assert!(matches!(
            object.invalidate(&reader),
            Err(DirectoryError::ReadersActive { .. })
        ));

        reader.release();
        let writer = object.acquire_for_write(ACCEL).unwrap();
        assert_eq!(writer.version(), 2);
        assert_eq!(object.owner_device(), Some(ACCEL));
    }

    #[test]
    fn test_write_refused_while_under_transfer() {
        let object = object();
        owned_at(&object, HOST, 1);

        let handle = started(object.acquire_for_read(ACCEL).unwrap());
        assert_eq!(
            object.acquire_for_write(ACCEL).unwrap_err(),
            DirectoryError::TransferInFlight { device: ACCEL }
        );
        handle.complete();
    }

    #[test]
    fn test_read_without_any_valid_copy() {
        let object = object();
        assert_eq!(
            object.acquire_for_read(HOST).unwrap_err(),
            DirectoryError::NoValidSource { key: DataKey(7) }
        );
    }

    #[test]
    fn test_read_falls_back_to_shared_copy() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 3);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();

        // Owner gives up its copy; the accelerator replica is still current.
        let host = object.copy(HOST).unwrap();
        object.invalidate(&host).unwrap();
        assert_eq!(object.owner_device(), None);

        let handle = started(object.acquire_for_read(DeviceIndex(2)).unwrap());
        assert_eq!(handle.source().device(), ACCEL);
        assert_eq!(handle.source_version(), 3);
        transport.execute(handle).unwrap();
    }

    #[test]
    fn test_write_mode_transfer_moves_ownership() {
        let object = object();
        owned_at(&object, HOST, 4);
        let old = object.copy(HOST).unwrap();
        let target = object.get_or_create_copy(ACCEL).unwrap();

        let handle = object
            .begin_transfer(&target, &old, AccessMode::Write)
            .unwrap()
            .into_handle()
            .unwrap();
        LocalTransport::new().execute(handle).unwrap();

        assert_eq!(target.coherency(), CoherencyState::Owned);
        assert_eq!(target.version(), 4);
        assert_eq!(old.coherency(), CoherencyState::Invalid);
        assert_eq!(object.owner_device(), Some(ACCEL));
        assert_eq!(object.owned_copies(), 1);

        drop(old);
        assert_eq!(object.copy_count(), 1);
    }

    #[test]
    fn test_refused_write_leaves_copies_untouched() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        let reader = ready(object.acquire_for_read(ACCEL).unwrap());

        assert!(matches!(
            object.acquire_for_write(ACCEL),
            Err(DirectoryError::ReadersActive { .. })
        ));

        assert_eq!(object.version(), 1);
        assert_eq!(object.owner_device(), Some(HOST));
        let host = object.copy(HOST).unwrap();
        assert_eq!(host.coherency(), CoherencyState::Owned);
        assert!(object.is_current(&host));
        assert_eq!(reader.coherency(), CoherencyState::Shared);
        assert_eq!(reader.version(), 1);
        assert!(object.is_current(&reader));
        reader.release();
    }

    #[test]
    fn test_write_racing_reader_keeps_a_current_owner() {
        let object = object();
        let transport = Arc::new(LocalTransport::new());
        owned_at(&object, HOST, 1);

        let reader = {
            let object = Arc::clone(&object);
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                for _ in 0..2000 {
                    match object.acquire_for_read(ACCEL) {
                        Ok(ReadAccess::Ready(copy)) => copy.release(),
                        Ok(ReadAccess::Pending(request)) => {
                            if !transport.drive(request).unwrap() {
                                thread::yield_now();
                            }
                        }
                        // A claimed write briefly leaves no current source.
                        Err(DirectoryError::NoValidSource { .. })
                        | Err(DirectoryError::ReadersActive { .. }) => thread::yield_now(),
                        Err(err) => panic!("unexpected read error: {err}"),
                    }
                }
            })
        };

        let mut writes = 0;
        for _ in 0..2000 {
            match object.acquire_for_write(ACCEL) {
                Ok(copy) => {
                    copy.bytes_mut().unwrap()[0] = 1;
                    writes += 1;
                }
                Err(DirectoryError::ReadersActive { .. })
                | Err(DirectoryError::TransferInFlight { .. }) => {}
                Err(err) => panic!("unexpected write error: {err}"),
            }
            let owner = object.owner_device().expect("an owner after every write attempt");
            let copy = object.copy(owner).unwrap();
            assert!(object.is_current(&copy), "owner copy fell behind: {:?}", object);
        }
        reader.join().unwrap();

        assert_eq!(object.version(), 1 + writes);
        let handle = started(object.acquire_for_read(DeviceIndex(2)).unwrap());
        assert_eq!(handle.source_version(), object.version());
        transport.execute(handle).unwrap();
    }

    #[test]
    fn test_ownership_never_doubles_while_moving() {
        let object = object();
        owned_at(&object, HOST, 1);

        let writer = {
            let object = Arc::clone(&object);
            thread::spawn(move || {
                for i in 0..2000 {
                    let device = if i % 2 == 0 { ACCEL } else { HOST };
                    object.acquire_for_write(device).unwrap().release();
                }
            })
        };

        loop {
            let done = writer.is_finished();
            // Only trust a sample taken while no write published in between.
            let before = object.version();
            let owned = object.owned_copies();
            if object.version() == before {
                assert!(owned <= 1, "{owned} owners at version {before}");
            }
            if done {
                break;
            }
        }
        writer.join().unwrap();

        assert_eq!(object.owned_copies(), 1);
        assert_eq!(object.version(), 2001);
    }

    #[test]
    fn test_owner_is_never_refilled() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();

        let host = object.copy(HOST).unwrap();
        let accel = object.copy(ACCEL).unwrap();
        let request = object
            .begin_transfer(&host, &accel, AccessMode::Read)
            .unwrap();
        assert!(request.is_in_flight());
        assert_eq!(host.coherency(), CoherencyState::Owned);
        assert_eq!(object.owner_device(), Some(HOST));
    }

    #[test]
    fn test_stale_source_is_refused() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        let stale = object.copy(ACCEL).unwrap();
        owned_at(&object, HOST, 1);

        let target = object.get_or_create_copy(DeviceIndex(2)).unwrap();
        assert_eq!(
            object
                .begin_transfer(&target, &stale, AccessMode::Read)
                .unwrap_err(),
            DirectoryError::NoValidSource { key: DataKey(7) }
        );
    }

    #[test]
    fn test_invalidate_rejects_foreign_copy() {
        let object = object();
        let other = DataObject::new(DataKey(8), TILE, registry()).unwrap();
        owned_at(&other, HOST, 1);
        let foreign = other.copy(HOST).unwrap();

        assert_eq!(
            object.invalidate(&foreign).unwrap_err(),
            DirectoryError::ForeignCopy {
                key: DataKey(7),
                device: HOST
            }
        );
        assert_eq!(foreign.coherency(), CoherencyState::Owned);
        assert_eq!(other.owner_device(), Some(HOST));
    }

    #[test]
    fn test_concurrent_readers_balance() {
        let object = object();
        let transport = LocalTransport::new();
        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let object = Arc::clone(&object);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let reader = ready(object.acquire_for_read(ACCEL).unwrap());
                        assert!(reader.reader_count() >= 1);
                        assert_eq!(reader.version(), 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(object.copy(ACCEL).unwrap().reader_count(), 0);
    }
}

#[cfg(test)]
mod release_tests {
    use super::*;

    #[test]
    fn test_stale_copy_returns_buffer_to_device() {
        let devices = registry();
        let object = DataObject::new(DataKey(1), TILE, Arc::clone(&devices)).unwrap();
        let accel = devices.get(ACCEL).unwrap().allocator().clone();

        owned_at(&object, ACCEL, 1);
        assert_eq!(accel.allocated(), TILE);
        assert_eq!(object.copy_count(), 1);

        // Host write invalidates the unreferenced accelerator copy.
        owned_at(&object, HOST, 1);
        assert_eq!(object.copy_count(), 1);
        assert!(object.copy(ACCEL).is_none());
        assert_eq!(accel.allocated(), 0);
    }

    #[test]
    fn test_remote_write_releases_unreferenced_shared_copy() {
        let devices = registry();
        let object = DataObject::new(DataKey(2), TILE, Arc::clone(&devices)).unwrap();
        let accel = devices.get(ACCEL).unwrap().allocator().clone();
        let transport = LocalTransport::new();

        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        ready(object.acquire_for_read(ACCEL).unwrap()).release();
        assert_eq!(object.copy_count(), 2);
        assert_eq!(accel.allocated(), TILE);

        let writer = object.acquire_for_write(HOST).unwrap();
        assert_eq!(writer.version(), 2);
        assert_eq!(object.copy_count(), 1);
        assert_eq!(accel.allocated(), 0);
    }

    #[test]
    fn test_referenced_stale_copy_waits_for_release() {
        let devices = registry();
        let object = DataObject::new(DataKey(3), TILE, Arc::clone(&devices)).unwrap();
        let accel = devices.get(ACCEL).unwrap().allocator().clone();
        let transport = LocalTransport::new();

        owned_at(&object, HOST, 1);
        transport
            .execute(started(object.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        let reader = ready(object.acquire_for_read(ACCEL).unwrap());

        owned_at(&object, HOST, 1);
        assert_eq!(object.copy_count(), 2);
        assert!(!object.is_current(&reader));
        assert_eq!(accel.allocated(), TILE);

        reader.release();
        assert_eq!(object.copy_count(), 1);
        assert_eq!(accel.allocated(), 0);
    }

    #[test]
    fn test_stale_copy_frees_budget_for_next_tile() {
        let devices = Arc::new(DeviceRegistry::host_with_accelerators(1, TILE).unwrap());
        let a = DataObject::new(DataKey(1), TILE, Arc::clone(&devices)).unwrap();
        let b = DataObject::new(DataKey(2), TILE, Arc::clone(&devices)).unwrap();
        let transport = LocalTransport::new();
        owned_at(&a, HOST, 1);
        owned_at(&b, HOST, 1);

        transport
            .execute(started(a.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        owned_at(&a, HOST, 1);

        transport
            .execute(started(b.acquire_for_read(ACCEL).unwrap()))
            .unwrap();
        let copy = ready(b.acquire_for_read(ACCEL).unwrap());
        assert_eq!(copy.version(), 1);
        assert_eq!(a.copy_count(), 1);
    }

    #[test]
    fn test_current_copy_survives_last_release() {
        let object = object();
        owned_at(&object, HOST, 1);
        assert_eq!(object.active_refs(), 0);
        assert_eq!(object.copy_count(), 1);
        assert!(object.is_current(&object.copy(HOST).unwrap()));
    }

    #[test]
    fn test_guard_outliving_object_is_harmless() {
        let object = object();
        owned_at(&object, HOST, 1);
        let copy = object.copy(HOST).unwrap();
        drop(object);
        assert!(copy.original().is_none());
        copy.release();
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;

    #[test]
    fn test_data_of_is_lazy_and_stable() {
        let collection = DataCollection::new("A", TILE, registry());
        assert!(collection.is_empty());
        assert!(collection.get(DataKey(3)).is_none());

        let a = collection.data_of(DataKey(3)).unwrap();
        let b = collection.data_of(DataKey(3)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_insert_tile_seeds_owner() {
        let collection = DataCollection::new("A", 4, registry());
        let object = collection
            .insert_tile(DataKey(0), HOST, &[1, 2, 3, 4])
            .unwrap();

        assert_eq!(object.owner_device(), Some(HOST));
        assert_eq!(object.version(), 1);
        let copy = object.copy(HOST).unwrap();
        assert_eq!(&*copy.bytes().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_insert_tile_checks_size() {
        let collection = DataCollection::new("A", 4, registry());
        assert_eq!(
            collection
                .insert_tile(DataKey(0), HOST, &[1, 2, 3])
                .unwrap_err(),
            DirectoryError::SizeMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_keys_sorted() {
        let collection = DataCollection::new("A", TILE, registry());
        for k in [5, 1, 3] {
            collection.data_of(DataKey(k)).unwrap();
        }
        assert_eq!(
            collection.keys(),
            vec![DataKey(1), DataKey(3), DataKey(5)]
        );
    }
}
