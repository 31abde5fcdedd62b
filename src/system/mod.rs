pub mod reset;

pub use reset::PlatformReset;

/// Log why the device booted and which image it runs
pub fn log_boot_info() {
    log::info!("Boot reason: {}", reset::get_reset_reason());

    #[cfg(target_os = "espidf")]
    {
        log::info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });
        match crate::ota::esp_store::running_partition_label() {
            Some(label) => log::info!("Running from partition {}", label),
            None => log::warn!("Running partition unknown"),
        }
    }
}
