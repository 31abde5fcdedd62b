// OTA partition backends
//
// The receiver writes into whichever of ota_0/ota_1 is not the boot partition.
// On the device that is the ESP-IDF OTA API; the host simulator keeps both
// slots in RAM.

#[cfg(target_os = "espidf")]
pub mod esp_store;

#[cfg(target_os = "espidf")]
pub type PlatformStore = esp_store::EspPartitionStore;

#[cfg(not(target_os = "espidf"))]
pub type PlatformStore = update_core::MemoryPartitionStore;

/// Size of each simulated slot, matching a 1.5MB OTA partition
#[cfg(not(target_os = "espidf"))]
pub const HOST_PARTITION_SIZE: u32 = 0x18_0000;

#[cfg(target_os = "espidf")]
pub fn platform_store() -> anyhow::Result<PlatformStore> {
    Ok(esp_store::EspPartitionStore::new()?)
}

#[cfg(not(target_os = "espidf"))]
pub fn platform_store() -> anyhow::Result<PlatformStore> {
    Ok(update_core::MemoryPartitionStore::new(HOST_PARTITION_SIZE))
}
