/// Device reset primitive and reset diagnostics

use update_core::DeviceReset;

#[cfg(target_os = "espidf")]
pub type PlatformReset = EspReset;

#[cfg(not(target_os = "espidf"))]
pub type PlatformReset = HostReset;

/// Restarts the chip through esp_restart()
#[cfg(target_os = "espidf")]
pub struct EspReset;

#[cfg(target_os = "espidf")]
impl DeviceReset for EspReset {
    fn reset(&self) {
        // Small delay to ensure UART output completes
        esp_idf_hal::delay::Ets::delay_us(1000);
        unsafe { esp_idf_sys::esp_restart() }
    }
}

/// Host simulator reset: dumps the new boot image and exits the process
#[cfg(not(target_os = "espidf"))]
pub struct HostReset {
    store: update_core::MemoryPartitionStore,
}

#[cfg(not(target_os = "espidf"))]
impl HostReset {
    pub fn new(store: update_core::MemoryPartitionStore) -> Self {
        Self { store }
    }
}

#[cfg(not(target_os = "espidf"))]
impl DeviceReset for HostReset {
    fn reset(&self) {
        let label = self.store.boot_label();
        let image = self.store.contents(&label).unwrap_or_default();
        let path = format!("ota-receiver-{}.bin", label);
        match std::fs::write(&path, &image) {
            Ok(()) => log::info!("Wrote {} byte image to {}", image.len(), path),
            Err(e) => log::error!("Failed to write {}: {}", path, e),
        }
        log::info!("Simulated restart into {}", label);
        log::logger().flush();
        std::process::exit(0);
    }
}

/// Get the last reset reason as a string
#[cfg(target_os = "espidf")]
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_UNKNOWN => "Unknown",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown reason code",
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn get_reset_reason() -> &'static str {
    "Host simulator start"
}
