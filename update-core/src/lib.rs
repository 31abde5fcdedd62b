//! Update Core - hardware-independent logic for the UDP OTA receiver
//!
//! This crate contains the update protocol (packet codec, session state machine,
//! restart coordination) and can be tested on the host platform without
//! requiring ESP32 hardware. Flash and reset primitives are reached through the
//! [`PartitionStore`] and [`DeviceReset`] traits.

pub mod codec;
pub mod config;
pub mod manager;
pub mod partition;
pub mod session;

pub use codec::{Metadata, Packet, PacketBody, ParseError, Reply};
pub use config::SessionOptions;
pub use manager::{DeviceReset, UpdateManager};
pub use partition::{MemoryPartitionStore, Partition, PartitionStore, StoreError};
pub use session::{SessionState, UpdateSession};
