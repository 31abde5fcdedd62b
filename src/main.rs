use anyhow::Result;
use log::info;
use update_core::UpdateManager;

#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod ota;
mod system;
mod version;

fn main() -> Result<()> {
    // Initialize ESP-IDF
    #[cfg(target_os = "espidf")]
    esp_idf_svc::sys::link_patches();

    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    info!("UDP OTA receiver {}", version::full_version());
    system::log_boot_info();

    #[cfg(target_os = "espidf")]
    let (config, _wifi) = {
        use esp_idf_hal::peripherals::Peripherals;
        use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        let config = config::load_or_default(nvs.clone())?;
        config.apply_log_level();

        let mut wifi = network::wifi::WifiManager::new(
            peripherals.modem,
            sys_loop,
            nvs,
            env!("WIFI_SSID"),
            env!("WIFI_PASSWORD"),
        )?;
        wifi.connect()?;
        (config, wifi)
    };

    #[cfg(not(target_os = "espidf"))]
    let config = {
        let config = config::load_or_default()?;
        config.apply_log_level();
        config
    };

    let options = config.session;
    info!(
        "Receiver options: port {}, auto restart {}, restart delay {} ms",
        options.listen_port, options.auto_restart, options.restart_delay_ms
    );

    let store = ota::platform_store()?;

    #[cfg(target_os = "espidf")]
    let reset = system::reset::EspReset;
    #[cfg(not(target_os = "espidf"))]
    let reset = system::reset::HostReset::new(store.clone());

    let manager: UpdateManager<ota::PlatformStore, system::PlatformReset> =
        UpdateManager::new(store, options, reset);

    let socket = network::receiver::bind(options.listen_port)?;
    let receiver = network::receiver::start(socket, manager)?;

    if receiver.join().is_err() {
        anyhow::bail!("Update receiver thread panicked");
    }
    Ok(())
}
