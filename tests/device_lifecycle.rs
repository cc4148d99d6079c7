//! Attach/detach lifecycle of sandbox devices against a recording receiver.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{HvCall, MockHypervisor, MockReceiver, ReceiverCall};
use sandbox_hotplug::config::{BlockDriver, HotplugConfig, BLOCK_DRIVER_OPTION};
use sandbox_hotplug::devices::{
    BlockDevice, Device, DeviceAttrs, DeviceInfo, DeviceManager, DeviceType, GenericDevice,
    VfioDevice, VhostUserBlkDevice, VHOST_USER_BLK_MAJOR,
};
use sandbox_hotplug::hypervisor::Hypervisor;
use sandbox_hotplug::sandbox::{DeviceReceiver, HypervisorReceiver};
use sandbox_hotplug::Error;

fn block_device(id: &str) -> BlockDevice {
    BlockDevice::new(
        DeviceInfo::new(id, format!("/dev/{}", id))
            .block(8, 16)
            .driver_option(BLOCK_DRIVER_OPTION, "virtio-blk"),
    )
}

// =============================================================================
// REFERENCE COUNTING
// =============================================================================

#[tokio::test]
async fn test_double_attach_hotplugs_once() {
    let receiver = MockReceiver::new();
    let dev = block_device("sdb");

    dev.attach(&receiver).await.unwrap();
    dev.attach(&receiver).await.unwrap();

    assert_eq!(dev.attach_count(), 2);
    assert_eq!(receiver.hotplug_adds(), 1);
    assert_eq!(receiver.allocator.in_use(), vec![0]);
    assert_eq!(dev.drive().virt_path.as_deref(), Some("/dev/vda"));

    // First detach only drops a holder.
    dev.detach(&receiver).await.unwrap();
    assert_eq!(dev.attach_count(), 1);
    assert_eq!(receiver.hotplug_removes(), 0);
    assert_eq!(receiver.allocator.in_use(), vec![0]);

    dev.detach(&receiver).await.unwrap();
    assert_eq!(dev.attach_count(), 0);
    assert_eq!(receiver.hotplug_removes(), 1);
    assert!(receiver.allocator.in_use().is_empty());
    assert_eq!(dev.drive().index, None);
}

#[tokio::test]
async fn test_detach_at_zero_is_invalid_state() {
    let receiver = MockReceiver::new();
    let dev = block_device("sdc");

    let err = dev.detach(&receiver).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(dev.attach_count(), 0);
    assert!(receiver.calls().is_empty());
}

#[tokio::test]
async fn test_generic_device_never_reaches_receiver() {
    let receiver = MockReceiver::new();
    let dev = GenericDevice::new(DeviceInfo::new("fuse", "/dev/fuse").character(10, 229));

    dev.attach(&receiver).await.unwrap();
    dev.attach(&receiver).await.unwrap();
    dev.detach(&receiver).await.unwrap();
    dev.detach(&receiver).await.unwrap();

    assert_eq!(dev.attach_count(), 0);
    assert!(receiver.calls().is_empty());
}

// =============================================================================
// COMPENSATION
// =============================================================================

#[tokio::test]
async fn test_index_allocation_failure_rolls_back_count() {
    let receiver = MockReceiver::with_max_index(0);
    receiver.allocator.get_and_set().unwrap();
    let dev = block_device("sdd");

    let err = dev.attach(&receiver).await.unwrap_err();
    assert!(matches!(err, Error::AllocationFailure(_)));
    assert_eq!(dev.attach_count(), 0);
    assert_eq!(receiver.hotplug_adds(), 0);
}

#[tokio::test]
async fn test_hotplug_failure_releases_index() {
    let receiver = MockReceiver::new();
    receiver.fail_hotplug_add.store(true, Ordering::SeqCst);
    let dev = block_device("sde");

    let err = dev.attach(&receiver).await.unwrap_err();
    assert!(matches!(err, Error::HotplugFailure { .. }));
    assert_eq!(dev.attach_count(), 0);
    assert!(receiver.allocator.in_use().is_empty());
    assert_eq!(
        receiver.calls(),
        vec![ReceiverCall::GetIndex(0), ReceiverCall::ReleaseIndex(0)]
    );
    assert_eq!(dev.drive().index, None);
    assert_eq!(dev.drive().virt_path, None);

    // The device is usable again once the receiver recovers.
    receiver.fail_hotplug_add.store(false, Ordering::SeqCst);
    dev.attach(&receiver).await.unwrap();
    assert_eq!(dev.attach_count(), 1);
    assert_eq!(receiver.allocator.in_use(), vec![0]);
}

#[tokio::test]
async fn test_failed_hot_unplug_keeps_device_attached() {
    let receiver = MockReceiver::new();
    let dev = block_device("sdf");
    dev.attach(&receiver).await.unwrap();

    receiver.fail_hotplug_remove.store(true, Ordering::SeqCst);
    assert!(dev.detach(&receiver).await.is_err());
    assert_eq!(dev.attach_count(), 1);
    assert_eq!(receiver.allocator.in_use(), vec![0]);
    assert_eq!(dev.drive().index, Some(0));

    receiver.fail_hotplug_remove.store(false, Ordering::SeqCst);
    dev.detach(&receiver).await.unwrap();
    assert!(receiver.allocator.in_use().is_empty());
}

// =============================================================================
// VARIANTS
// =============================================================================

#[tokio::test]
async fn test_indices_are_unique_across_devices() {
    let receiver = MockReceiver::new();
    let a = block_device("sdg");
    let b = block_device("sdh");

    a.attach(&receiver).await.unwrap();
    b.attach(&receiver).await.unwrap();
    assert_eq!(a.drive().index, Some(0));
    assert_eq!(b.drive().index, Some(1));
    assert_eq!(b.drive().virt_path.as_deref(), Some("/dev/vdb"));

    // A released index is handed out again.
    a.detach(&receiver).await.unwrap();
    let c = block_device("sdi");
    c.attach(&receiver).await.unwrap();
    assert_eq!(c.drive().index, Some(0));
}

#[tokio::test]
async fn test_vhost_user_blk_holds_index_while_attached() {
    let receiver = MockReceiver::new();
    let dev = VhostUserBlkDevice::new(
        DeviceInfo::new("vblk", "/run/vhost/blk0.sock").block(VHOST_USER_BLK_MAJOR, 0),
    );

    dev.attach(&receiver).await.unwrap();
    assert_eq!(dev.block_index(), Some(0));
    let calls = receiver.calls();
    assert!(matches!(
        &calls[1],
        ReceiverCall::HotplugAdd {
            device_type: DeviceType::VhostUserBlk,
            attrs: DeviceAttrs::VhostUser(attrs),
            ..
        } if attrs.socket_path == std::path::Path::new("/run/vhost/blk0.sock")
    ));

    dev.detach(&receiver).await.unwrap();
    assert_eq!(dev.block_index(), None);
    assert!(receiver.allocator.in_use().is_empty());
}

#[tokio::test]
async fn test_vhost_user_blk_hotplug_failure_clears_index() {
    let receiver = MockReceiver::new();
    receiver.fail_hotplug_add.store(true, Ordering::SeqCst);
    let dev = VhostUserBlkDevice::new(DeviceInfo::new("vblk", "/run/vhost/blk1.sock"));

    assert!(dev.attach(&receiver).await.is_err());
    assert_eq!(dev.block_index(), None);
    assert_eq!(dev.attach_count(), 0);
    assert!(receiver.allocator.in_use().is_empty());
}

#[tokio::test]
async fn test_vfio_cold_plug_appends_and_stays() {
    let sysfs = tempfile::tempdir().unwrap();
    let group = sysfs.path().join("kernel/iommu_groups/5/devices/0000:02:00.0");
    std::fs::create_dir_all(&group).unwrap();

    let receiver = MockReceiver::new();
    let dev = VfioDevice::new(
        DeviceInfo::new("nic", "/dev/vfio/5").cold_plug(true),
        sysfs.path(),
    );

    dev.attach(&receiver).await.unwrap();
    dev.detach(&receiver).await.unwrap();

    assert_eq!(
        receiver.calls(),
        vec![ReceiverCall::Append { id: "nic".into() }]
    );
    assert_eq!(dev.devices()[0].bdf, "02:00.0");
}

#[tokio::test]
async fn test_vfio_missing_group_rolls_back() {
    let sysfs = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::new();
    let dev = VfioDevice::new(DeviceInfo::new("gpu", "/dev/vfio/9"), sysfs.path());

    assert!(dev.attach(&receiver).await.is_err());
    assert_eq!(dev.attach_count(), 0);
    assert!(receiver.calls().is_empty());
}

// =============================================================================
// HYPERVISOR RECEIVER
// =============================================================================

#[tokio::test]
async fn test_hypervisor_receiver_forwards_descriptors() {
    let hv = Arc::new(MockHypervisor::new(1));
    let hypervisor: Arc<dyn Hypervisor> = hv.clone();
    let receiver = HypervisorReceiver::new(hypervisor, 8);

    let vblk = VhostUserBlkDevice::new(
        DeviceInfo::new("vblk", "/run/vhost/blk0.sock").block(VHOST_USER_BLK_MAJOR, 0),
    );
    let disk = block_device("sdj");
    vblk.attach(&receiver).await.unwrap();
    disk.attach(&receiver).await.unwrap();
    assert_eq!(receiver.block_indices(), vec![0, 1]);

    vblk.detach(&receiver).await.unwrap();
    assert_eq!(receiver.block_indices(), vec![1]);
    assert_eq!(
        hv.calls(),
        vec![
            HvCall::HotplugAdd { kind: "vhost-user", endpoint: None },
            HvCall::HotplugAdd { kind: "block", endpoint: None },
            HvCall::HotplugRemove { kind: "vhost-user", endpoint: None },
        ]
    );
}

#[tokio::test]
async fn test_hypervisor_receiver_refuses_generic_hotplug() {
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new(1));
    let receiver = HypervisorReceiver::new(hypervisor, 8);
    let dev = GenericDevice::new(DeviceInfo::new("tty", "/dev/ttyS0").character(4, 64));

    let err = receiver
        .hotplug_add_device(&dev, DeviceType::Generic)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attach_of_shared_device() {
    let receiver = Arc::new(MockReceiver::new());
    let manager = Arc::new(DeviceManager::new(
        HotplugConfig::new().block_driver(BlockDriver::VirtioScsi),
    ));
    let dev = manager
        .new_device(DeviceInfo::new("shared", "/dev/sdz").block(65, 144))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let receiver = Arc::clone(&receiver);
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.attach_device("shared", receiver.as_ref()).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(dev.attach_count(), 16);
    assert_eq!(receiver.hotplug_adds(), 1);
    assert_eq!(receiver.allocator.in_use(), vec![0]);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let receiver = Arc::clone(&receiver);
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.detach_device("shared", receiver.as_ref()).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(dev.attach_count(), 0);
    assert_eq!(receiver.hotplug_removes(), 1);
    assert!(receiver.allocator.in_use().is_empty());
    assert!(!manager.is_device_attached("shared").unwrap());
}

fn hotpluggable_devices(sysfs: &std::path::Path) -> Vec<Box<dyn Device>> {
    vec![
        Box::new(block_device("sdc")),
        Box::new(VhostUserBlkDevice::new(
            DeviceInfo::new("vblk", "/run/vhost/blk0.sock").block(VHOST_USER_BLK_MAJOR, 1),
        )),
        Box::new(VfioDevice::new(DeviceInfo::new("nic", "/dev/vfio/3"), sysfs)),
    ]
}

#[tokio::test]
async fn test_second_attach_waits_for_failing_hotplug() {
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(sysfs.path().join("kernel/iommu_groups/3/devices/0000:05:00.0"))
        .unwrap();

    for dev in hotpluggable_devices(sysfs.path()) {
        let receiver = MockReceiver::new();
        receiver.fail_hotplug_add.store(true, Ordering::SeqCst);

        // The first attach yields inside the receiver before failing; the
        // second must not report success on the strength of that attempt.
        let (first, second) = tokio::join!(dev.attach(&receiver), dev.attach(&receiver));
        assert!(
            matches!(first, Err(Error::HotplugFailure { .. })),
            "{}: {:?}",
            dev.id(),
            first
        );
        assert!(
            matches!(second, Err(Error::HotplugFailure { .. })),
            "{}: {:?}",
            dev.id(),
            second
        );
        assert_eq!(dev.attach_count(), 0, "{}", dev.id());
        assert!(receiver.allocator.in_use().is_empty());
        assert_eq!(receiver.hotplug_removes(), 0);

        assert!(matches!(
            dev.detach(&receiver).await,
            Err(Error::InvalidState(_))
        ));
    }
}

#[tokio::test]
async fn test_detach_during_failing_attach_removes_nothing() {
    let sysfs = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(sysfs.path().join("kernel/iommu_groups/3/devices/0000:05:00.0"))
        .unwrap();

    for dev in hotpluggable_devices(sysfs.path()) {
        let receiver = MockReceiver::new();
        receiver.fail_hotplug_add.store(true, Ordering::SeqCst);

        let (attached, detached) = tokio::join!(dev.attach(&receiver), dev.detach(&receiver));
        assert!(attached.is_err(), "{}", dev.id());
        assert!(
            matches!(detached, Err(Error::InvalidState(_))),
            "{}: {:?}",
            dev.id(),
            detached
        );
        assert_eq!(dev.attach_count(), 0);
        assert_eq!(receiver.hotplug_removes(), 0);
        assert!(receiver.allocator.in_use().is_empty());
    }
}

#[tokio::test]
async fn test_reattach_during_detach_rebinds_released_index() {
    let receiver = MockReceiver::new();
    let dev = block_device("sdd");
    dev.attach(&receiver).await.unwrap();

    // The hot-unplug yields; the attach queued behind it must see the index
    // released and claim it again.
    let (detached, attached) = tokio::join!(dev.detach(&receiver), dev.attach(&receiver));
    detached.unwrap();
    attached.unwrap();

    assert_eq!(dev.attach_count(), 1);
    assert_eq!(dev.drive().index, Some(0));
    assert_eq!(dev.drive().virt_path.as_deref(), Some("/dev/vda"));
    assert_eq!(receiver.allocator.in_use(), vec![0]);
    assert!(matches!(
        receiver.calls().as_slice(),
        [
            ReceiverCall::GetIndex(0),
            ReceiverCall::HotplugAdd { .. },
            ReceiverCall::HotplugRemove { .. },
            ReceiverCall::ReleaseIndex(0),
            ReceiverCall::GetIndex(0),
            ReceiverCall::HotplugAdd { .. },
        ]
    ));
}
