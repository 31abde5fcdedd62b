//! Flash partition abstraction for the two OTA application slots.
//!
//! The device build implements [`PartitionStore`] over the ESP-IDF OTA API; the
//! [`MemoryPartitionStore`] here backs the host simulator and the tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const PARTITION_LABELS: [&str; 2] = ["ota_0", "ota_1"];

/// Partition labels are at most 16 bytes in the partition table
pub type PartitionLabel = heapless::String<16>;

/// Owned description of one flash partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: PartitionLabel,
    pub address: u32,
    pub size: u32,
}

impl Partition {
    pub fn new(label: &str, address: u32, size: u32) -> Result<Self, StoreError> {
        let label = PartitionLabel::try_from(label)
            .map_err(|_| StoreError::LabelTooLong(label.to_string()))?;
        Ok(Self {
            label,
            address,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no boot partition reported")]
    NoBootPartition,
    #[error("partition '{0}' not found")]
    NotFound(String),
    #[error("partition label '{0}' is too long")]
    LabelTooLong(String),
    #[error("begin write failed (code {0})")]
    Begin(i32),
    #[error("write failed (code {0})")]
    Write(i32),
    #[error("end write failed (code {0})")]
    End(i32),
    #[error("set boot partition failed (code {0})")]
    SetBoot(i32),
    #[error("write of {len} bytes at offset {offset} exceeds partition size {size}")]
    OutOfSpace { offset: usize, len: usize, size: u32 },
}

/// Opaque partition-write API over the flash
pub trait PartitionStore {
    /// Handle for one open write, from `begin_write` until `end_write`
    type Writer;

    fn boot_partition(&self) -> Result<Partition, StoreError>;
    fn find_partition(&self, label: &str) -> Result<Partition, StoreError>;
    fn begin_write(&mut self, partition: &Partition) -> Result<Self::Writer, StoreError>;
    fn write(&mut self, writer: &mut Self::Writer, data: &[u8]) -> Result<(), StoreError>;
    fn end_write(&mut self, writer: Self::Writer) -> Result<(), StoreError>;
    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), StoreError>;
}

/// Label of the slot an update should be written to, given the current boot slot
pub fn target_label(boot_label: &str) -> &'static str {
    if boot_label == PARTITION_LABELS[0] {
        PARTITION_LABELS[1]
    } else {
        PARTITION_LABELS[0]
    }
}

/// Operations of the in-memory store that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    BootLookup,
    Begin,
    Write,
    End,
    SetBoot,
}

const FAULT_CODE: i32 = -1;

struct Slot {
    partition: Partition,
    data: Vec<u8>,
    finalized: bool,
}

#[derive(Default)]
struct MemoryFlash {
    slots: Vec<Slot>,
    boot: usize,
    faults: Vec<Fault>,
    write_calls: usize,
    end_calls: usize,
}

impl MemoryFlash {
    fn slot_index(&self, label: &str) -> Result<usize, StoreError> {
        self.slots
            .iter()
            .position(|slot| slot.partition.label.as_str() == label)
            .ok_or_else(|| StoreError::NotFound(label.to_string()))
    }

    fn faulted(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }
}

/// Write handle of [`MemoryPartitionStore`]
#[derive(Debug)]
pub struct MemoryWriter {
    slot: usize,
}

/// Two OTA slots held in RAM. Clones share the same flash, so a test can keep
/// one handle for inspection while the session owns another.
#[derive(Clone)]
pub struct MemoryPartitionStore {
    inner: Arc<Mutex<MemoryFlash>>,
}

impl MemoryPartitionStore {
    /// Create `ota_0` and `ota_1` of `partition_size` bytes each, booting from `ota_0`
    pub fn new(partition_size: u32) -> Self {
        let slots = PARTITION_LABELS
            .iter()
            .zip([0x10000u32, 0x10000 + partition_size])
            .filter_map(|(label, address)| Partition::new(label, address, partition_size).ok())
            .map(|partition| Slot {
                partition,
                data: Vec::new(),
                finalized: false,
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(MemoryFlash {
                slots,
                ..Default::default()
            })),
        }
    }

    fn flash(&self) -> MutexGuard<'_, MemoryFlash> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, fault: Fault) {
        let mut flash = self.flash();
        if !flash.faulted(fault) {
            flash.faults.push(fault);
        }
    }

    pub fn clear_faults(&self) {
        self.flash().faults.clear();
    }

    pub fn boot_label(&self) -> String {
        let flash = self.flash();
        flash.slots[flash.boot].partition.label.to_string()
    }

    /// Bytes written to a slot since its last `begin_write`
    pub fn contents(&self, label: &str) -> Option<Vec<u8>> {
        let flash = self.flash();
        let index = flash.slot_index(label).ok()?;
        Some(flash.slots[index].data.clone())
    }

    pub fn is_finalized(&self, label: &str) -> bool {
        let flash = self.flash();
        flash
            .slot_index(label)
            .map(|index| flash.slots[index].finalized)
            .unwrap_or(false)
    }

    pub fn write_calls(&self) -> usize {
        self.flash().write_calls
    }

    pub fn end_calls(&self) -> usize {
        self.flash().end_calls
    }
}

impl PartitionStore for MemoryPartitionStore {
    type Writer = MemoryWriter;

    fn boot_partition(&self) -> Result<Partition, StoreError> {
        let flash = self.flash();
        if flash.faulted(Fault::BootLookup) {
            return Err(StoreError::NoBootPartition);
        }
        flash
            .slots
            .get(flash.boot)
            .map(|slot| slot.partition.clone())
            .ok_or(StoreError::NoBootPartition)
    }

    fn find_partition(&self, label: &str) -> Result<Partition, StoreError> {
        let flash = self.flash();
        let index = flash.slot_index(label)?;
        Ok(flash.slots[index].partition.clone())
    }

    fn begin_write(&mut self, partition: &Partition) -> Result<MemoryWriter, StoreError> {
        let mut flash = self.flash();
        if flash.faulted(Fault::Begin) {
            return Err(StoreError::Begin(FAULT_CODE));
        }
        let slot = flash.slot_index(&partition.label)?;
        flash.slots[slot].data.clear();
        flash.slots[slot].finalized = false;
        Ok(MemoryWriter { slot })
    }

    fn write(&mut self, writer: &mut MemoryWriter, data: &[u8]) -> Result<(), StoreError> {
        let mut flash = self.flash();
        flash.write_calls += 1;
        if flash.faulted(Fault::Write) {
            return Err(StoreError::Write(FAULT_CODE));
        }
        let slot = &mut flash.slots[writer.slot];
        let offset = slot.data.len();
        if offset + data.len() > slot.partition.size as usize {
            return Err(StoreError::OutOfSpace {
                offset,
                len: data.len(),
                size: slot.partition.size,
            });
        }
        slot.data.extend_from_slice(data);
        Ok(())
    }

    fn end_write(&mut self, writer: MemoryWriter) -> Result<(), StoreError> {
        let mut flash = self.flash();
        flash.end_calls += 1;
        if flash.faulted(Fault::End) {
            return Err(StoreError::End(FAULT_CODE));
        }
        flash.slots[writer.slot].finalized = true;
        Ok(())
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), StoreError> {
        let mut flash = self.flash();
        if flash.faulted(Fault::SetBoot) {
            return Err(StoreError::SetBoot(FAULT_CODE));
        }
        let slot = flash.slot_index(&partition.label)?;
        if !flash.slots[slot].finalized {
            return Err(StoreError::SetBoot(FAULT_CODE));
        }
        flash.boot = slot;
        Ok(())
    }
}
