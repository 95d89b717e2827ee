use std::sync::Arc;

use tessera::runtime::data::{
    AccessMode, CoherencyState, DataCollection, DataKey, DirectoryError, LocalTransport,
    ReadAccess, TransferStatus,
};
use tessera::runtime::device::{DeviceIndex, DeviceRegistry};

const HOST: DeviceIndex = DeviceIndex(0);
const GPU: DeviceIndex = DeviceIndex(1);

fn collection(tile: usize) -> DataCollection {
    let devices = DeviceRegistry::host_with_accelerators(1, 1 << 16).unwrap();
    DataCollection::new("matrix", tile, Arc::new(devices))
}

#[test]
fn test_read_write_read_cycle() {
    let tiles = collection(32);
    let transport = LocalTransport::new();
    let object = tiles.insert_tile(DataKey(0), HOST, &[7; 32]).unwrap();
    assert_eq!(object.version(), 1);

    // Pull to the accelerator.
    let handle = match object.acquire_for_read(GPU).unwrap() {
        ReadAccess::Pending(request) => request.into_handle().unwrap(),
        ReadAccess::Ready(_) => panic!("accelerator copy cannot be current yet"),
    };
    assert_eq!(handle.mode(), AccessMode::Read);
    assert_eq!(handle.target().transfer_status(), TransferStatus::UnderTransfer);
    transport.execute(handle).unwrap();

    let gpu = object.copy(GPU).unwrap();
    assert_eq!(gpu.coherency(), CoherencyState::Shared);
    assert_eq!(gpu.version(), 1);
    assert_eq!(&*gpu.bytes().unwrap(), &[7; 32][..]);

    // Write on the accelerator invalidates the host.
    {
        let copy = object.acquire_for_write(GPU).unwrap();
        copy.bytes_mut().unwrap().fill(8);
    }
    assert_eq!(object.version(), 2);
    assert_eq!(object.owner_device(), Some(GPU));
    // The invalidated host copy had no holders left, so it was dropped.
    assert!(object.copy(HOST).is_none());
    assert_eq!(object.copy_count(), 1);

    // Read back on the host.
    let request = match object.acquire_for_read(HOST).unwrap() {
        ReadAccess::Pending(request) => request,
        ReadAccess::Ready(_) => panic!("host copy is stale"),
    };
    assert!(transport.drive(request).unwrap());
    let host = match object.acquire_for_read(HOST).unwrap() {
        ReadAccess::Ready(copy) => copy,
        ReadAccess::Pending(_) => panic!("host copy should be current"),
    };
    assert_eq!(host.version(), 2);
    assert_eq!(&*host.bytes().unwrap(), &[8; 32][..]);
    assert_eq!(transport.stats().transfers, 2);
    assert_eq!(transport.stats().bytes_moved, 64);
}

#[test]
fn test_wrong_tile_size() {
    let tiles = collection(16);
    let err = tiles.insert_tile(DataKey(1), HOST, &[0; 8]).unwrap_err();
    assert_eq!(err, DirectoryError::SizeMismatch { expected: 16, actual: 8 });
}

#[test]
fn test_accelerator_budget_is_enforced() {
    let tiles = collection(1 << 15);
    tiles.insert_tile(DataKey(0), GPU, &vec![1; 1 << 15]).unwrap();
    tiles.insert_tile(DataKey(1), GPU, &vec![2; 1 << 15]).unwrap();
    let err = tiles.insert_tile(DataKey(2), GPU, &vec![3; 1 << 15]).unwrap_err();
    assert!(matches!(err, DirectoryError::Alloc(_)));
}
