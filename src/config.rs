use anyhow::Result;
use serde::{Deserialize, Serialize};
use update_core::SessionOptions;

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

#[cfg(target_os = "espidf")]
const CONFIG_NAMESPACE: &str = "ota_rx";
#[cfg(target_os = "espidf")]
const CONFIG_KEY: &str = "options";

#[cfg(not(target_os = "espidf"))]
const HOST_CONFIG_PATH: &str = "ota-receiver.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Receiver options
    #[serde(flatten)]
    pub session: SessionOptions,

    // Console log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn apply_log_level(&self) {
        if !crate::logging::set_max_level_from_str(&self.log_level) {
            log::warn!("Unknown log level '{}', keeping default", self.log_level);
        }
    }
}

pub fn parse(data: &[u8]) -> Result<Config> {
    let config = serde_json::from_slice(data)?;
    Ok(config)
}

#[cfg(target_os = "espidf")]
pub fn load_or_default(nvs_partition: EspDefaultNvsPartition) -> Result<Config> {
    match load_from_nvs(nvs_partition.clone()) {
        Ok(config) => {
            log::info!("Loaded configuration from NVS");
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = Config::default();

            // Try to save default config to NVS for next time
            if let Err(save_err) = save_to_nvs(nvs_partition, &config) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

#[cfg(target_os = "espidf")]
fn load_from_nvs(nvs_partition: EspDefaultNvsPartition) -> Result<Config> {
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 512]; // Max config size
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    parse(data)
}

#[cfg(target_os = "espidf")]
fn save_to_nvs(nvs_partition: EspDefaultNvsPartition, config: &Config) -> Result<()> {
    let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;
    log::info!("Configuration saved to NVS");

    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn load_or_default() -> Result<Config> {
    use anyhow::Context;

    let path = std::path::Path::new(HOST_CONFIG_PATH);
    if !path.exists() {
        log::info!("No {} found, using default configuration", HOST_CONFIG_PATH);
        return Ok(Config::default());
    }

    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", HOST_CONFIG_PATH))?;
    let config = parse(&data).with_context(|| format!("Invalid {}", HOST_CONFIG_PATH))?;
    log::info!("Loaded configuration from {}", HOST_CONFIG_PATH);
    Ok(config)
}
