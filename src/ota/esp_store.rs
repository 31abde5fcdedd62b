// Partition store over the ESP-IDF OTA API

use core::ffi::{c_void, CStr};
use std::ffi::CString;

use esp_idf_sys::{
    esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition, esp_ota_handle_t,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, EspError,
};
use update_core::partition::PARTITION_LABELS;
use update_core::{Partition, PartitionStore, StoreError};

/// Erase the whole target partition when a write begins
const ERASE_ENTIRE_PARTITION: usize = 0;

/// Open OTA write on one partition
pub struct EspOtaWrite {
    handle: esp_ota_handle_t,
}

/// The flash itself is owned by ESP-IDF; partitions are looked up by label
/// for every operation so no raw pointers are kept across calls.
pub struct EspPartitionStore;

impl EspPartitionStore {
    pub fn new() -> Result<Self, StoreError> {
        // Both slots must exist in the partition table
        for label in PARTITION_LABELS {
            find_raw(label)?;
        }
        Ok(Self)
    }
}

fn find_raw(label: &str) -> Result<*const esp_partition_t, StoreError> {
    let c_label = CString::new(label).map_err(|_| StoreError::NotFound(label.to_string()))?;
    let raw = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            c_label.as_ptr(),
        )
    };

    if raw.is_null() {
        return Err(StoreError::NotFound(label.to_string()));
    }
    Ok(raw)
}

fn describe(raw: *const esp_partition_t) -> Result<Partition, StoreError> {
    // SAFETY: raw is a non-null entry of the static partition table
    let entry = unsafe { &*raw };
    let label = unsafe { CStr::from_ptr(entry.label.as_ptr()) }.to_string_lossy();
    Partition::new(&label, entry.address, entry.size)
}

impl PartitionStore for EspPartitionStore {
    type Writer = EspOtaWrite;

    fn boot_partition(&self) -> Result<Partition, StoreError> {
        let raw = unsafe { esp_ota_get_boot_partition() };
        if raw.is_null() {
            return Err(StoreError::NoBootPartition);
        }
        describe(raw)
    }

    fn find_partition(&self, label: &str) -> Result<Partition, StoreError> {
        describe(find_raw(label)?)
    }

    fn begin_write(&mut self, partition: &Partition) -> Result<EspOtaWrite, StoreError> {
        let raw = find_raw(&partition.label)?;
        let mut handle: esp_ota_handle_t = 0;

        let result = unsafe { esp_ota_begin(raw, ERASE_ENTIRE_PARTITION, &mut handle as *mut _) };
        EspError::convert(result).map_err(|e| StoreError::Begin(e.code()))?;

        Ok(EspOtaWrite { handle })
    }

    fn write(&mut self, writer: &mut EspOtaWrite, data: &[u8]) -> Result<(), StoreError> {
        let result = unsafe {
            esp_ota_write(
                writer.handle,
                data.as_ptr() as *const c_void,
                data.len() as _,
            )
        };
        EspError::convert(result).map_err(|e| StoreError::Write(e.code()))
    }

    fn end_write(&mut self, writer: EspOtaWrite) -> Result<(), StoreError> {
        let result = unsafe { esp_ota_end(writer.handle) };
        EspError::convert(result).map_err(|e| StoreError::End(e.code()))
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), StoreError> {
        let raw = find_raw(&partition.label)?;
        let result = unsafe { esp_ota_set_boot_partition(raw) };
        EspError::convert(result).map_err(|e| StoreError::SetBoot(e.code()))
    }
}

/// Label of the partition the running image was loaded from
pub fn running_partition_label() -> Option<String> {
    let raw = unsafe { esp_idf_sys::esp_ota_get_running_partition() };
    if raw.is_null() {
        return None;
    }
    describe(raw).ok().map(|partition| partition.label.to_string())
}
