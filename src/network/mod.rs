pub mod receiver;

#[cfg(target_os = "espidf")]
pub mod wifi;
