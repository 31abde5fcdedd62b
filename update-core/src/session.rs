//! Update session state machine.
//!
//! One session lives from power-on to restart and is mutated only by the packet
//! handler, one datagram at a time. It owns the open write handle and the target
//! partition for the duration of a transfer.

use log::{debug, error, info, trace, warn};

use crate::codec::{self, Metadata, Packet, PacketBody, ParseError, Reply};
use crate::partition::{target_label, Partition, PartitionStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Updating,
    NewImageReady,
    NewImageSelected,
    /// Image ready, waiting out the restart delay
    PreRestartDelay,
    /// Finalizing the image failed; only a new metadata packet leaves this state
    Error,
}

pub struct UpdateSession<S: PartitionStore> {
    store: S,
    state: SessionState,
    last_sequence_number: u32,
    image_size_bytes: u32,
    num_packets: u32,
    image_checksum: u32,
    received_metadata: bool,
    bytes_written: u64,
    target: Option<Partition>,
    writer: Option<S::Writer>,
}

impl<S: PartitionStore> UpdateSession<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: SessionState::Idle,
            last_sequence_number: 0,
            image_size_bytes: 0,
            num_packets: 0,
            image_checksum: 0,
            received_metadata: false,
            bytes_written: 0,
            target: None,
            writer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_sequence_number(&self) -> u32 {
        self.last_sequence_number
    }

    pub fn received_metadata(&self) -> bool {
        self.received_metadata
    }

    pub fn image_size_bytes(&self) -> u32 {
        self.image_size_bytes
    }

    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    /// Checksum announced by the sender. Logged, not verified.
    pub fn image_checksum(&self) -> u32 {
        self.image_checksum
    }

    pub fn target_partition(&self) -> Option<&Partition> {
        self.target.as_ref()
    }

    /// Parse and apply one datagram. `None` means no reply must be sent.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Option<Reply> {
        match codec::parse(datagram) {
            Ok(packet) => Some(self.handle_packet(&packet)),
            Err(ParseError::NotAnUpdatePacket) => {
                trace!("Ignoring {} byte datagram without update marker", datagram.len());
                None
            }
            Err(ParseError::UnknownPacketType(packet_type)) => {
                debug!("Dropping update packet with unknown type {}", packet_type);
                None
            }
            Err(e) => {
                warn!("Dropping malformed update packet: {}", e);
                None
            }
        }
    }

    pub fn handle_packet(&mut self, packet: &Packet<'_>) -> Reply {
        let ok = match packet.body {
            PacketBody::Metadata(metadata) => self.on_metadata(packet.sequence_number, &metadata),
            PacketBody::ImageData(chunk) => self.on_image_data(packet.sequence_number, chunk),
        };

        if ok {
            Reply::Ack(self.last_sequence_number)
        } else {
            Reply::Error
        }
    }

    fn on_metadata(&mut self, sequence_number: u32, metadata: &Metadata) -> bool {
        if sequence_number != 0 {
            warn!("Metadata packet with sequence number {} rejected", sequence_number);
            return false;
        }

        self.state = SessionState::Updating;
        if self.received_metadata {
            info!("Metadata received again, restarting the transfer");
            self.abandon_write();
            self.last_sequence_number = 0;
            self.received_metadata = false;
        }

        info!(
            "New image: {} bytes in {} packets (checksum {:#010x})",
            metadata.image_size_bytes, metadata.num_packets, metadata.image_checksum
        );

        match self.open_target() {
            Ok(()) => {
                self.image_size_bytes = metadata.image_size_bytes;
                self.num_packets = metadata.num_packets;
                self.image_checksum = metadata.image_checksum;
                self.bytes_written = 0;
                self.received_metadata = true;
                true
            }
            Err(e) => {
                error!("Couldn't start update: {}", e);
                self.target = None;
                false
            }
        }
    }

    fn open_target(&mut self) -> Result<(), StoreError> {
        let boot = self.store.boot_partition()?;
        info!("Current boot partition: {} @ {:#x}", boot.label, boot.address);

        let target = self.store.find_partition(target_label(&boot.label))?;
        let writer = self.store.begin_write(&target)?;
        info!(
            "Loading to partition: {} @ {:#x} ({} bytes)",
            target.label, target.address, target.size
        );

        self.writer = Some(writer);
        self.target = Some(target);
        Ok(())
    }

    fn abandon_write(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = self.store.end_write(writer) {
                debug!("Closing abandoned write: {}", e);
            }
        }
    }

    fn on_image_data(&mut self, sequence_number: u32, chunk: &[u8]) -> bool {
        if sequence_number == 0 {
            warn!("Image data packet with sequence number 0 rejected");
            return false;
        }
        if self.state == SessionState::Error {
            warn!("Image data rejected until the transfer is restarted");
            return false;
        }

        if self.last_sequence_number.checked_add(1) == Some(sequence_number) {
            let Some(writer) = self.writer.as_mut() else {
                warn!("Image data packet {} without an open update", sequence_number);
                return false;
            };

            if let Err(e) = self.store.write(writer, chunk) {
                error!("OTA write of packet {} failed: {}", sequence_number, e);
                return false;
            }
            self.last_sequence_number = sequence_number;
            self.bytes_written += chunk.len() as u64;
            trace!("Wrote packet {}/{}", sequence_number, self.num_packets);

            if self.last_sequence_number == self.num_packets {
                return self.finish_image();
            }
            true
        } else if sequence_number <= self.last_sequence_number {
            warn!(
                "Got old sequence number {} (last {}), ignored but acked",
                sequence_number, self.last_sequence_number
            );
            true
        } else {
            warn!(
                "Got future sequence number {} (expected {}), ignored and errored",
                sequence_number,
                u64::from(self.last_sequence_number) + 1
            );
            false
        }
    }

    fn finish_image(&mut self) -> bool {
        let Some(writer) = self.writer.take() else {
            return false;
        };

        if self.bytes_written != u64::from(self.image_size_bytes) {
            warn!(
                "Image size mismatch: expected {} bytes, wrote {}",
                self.image_size_bytes, self.bytes_written
            );
        }

        match self.store.end_write(writer) {
            Ok(()) => {
                self.state = SessionState::NewImageReady;
                if let Some(target) = &self.target {
                    info!(
                        "New image ready in partition {} ({} bytes, announced checksum {:#010x})",
                        target.label, self.bytes_written, self.image_checksum
                    );
                }
                true
            }
            Err(e) => {
                error!("Finalizing new image failed: {}", e);
                self.state = SessionState::Error;
                false
            }
        }
    }

    /// Record the received image as the next boot partition.
    pub fn select_new_boot_partition(&mut self) -> bool {
        if !matches!(
            self.state,
            SessionState::NewImageReady | SessionState::PreRestartDelay
        ) {
            warn!("Cannot select new boot partition in state {:?}", self.state);
            return false;
        }
        let Some(target) = self.target.as_ref() else {
            return false;
        };

        match self.store.set_boot_partition(target) {
            Ok(()) => {
                info!("Boot partition set to {}", target.label);
                self.state = SessionState::NewImageSelected;
                true
            }
            Err(e) => {
                error!("OTA set boot partition failed: {}", e);
                false
            }
        }
    }

    pub(crate) fn enter_restart_delay(&mut self) -> bool {
        if self.state == SessionState::NewImageReady {
            self.state = SessionState::PreRestartDelay;
            true
        } else {
            false
        }
    }

    pub(crate) fn leave_restart_delay(&mut self) {
        if self.state == SessionState::PreRestartDelay {
            self.state = SessionState::NewImageReady;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_image_data, encode_metadata};
    use crate::partition::{Fault, MemoryPartitionStore};

    fn metadata(image_size_bytes: u32, num_packets: u32) -> Vec<u8> {
        encode_metadata(
            0,
            &Metadata {
                image_size_bytes,
                num_packets,
                image_checksum: 0,
            },
        )
    }

    fn session() -> (UpdateSession<MemoryPartitionStore>, MemoryPartitionStore) {
        let store = MemoryPartitionStore::new(1024);
        (UpdateSession::new(store.clone()), store)
    }

    #[test]
    fn test_metadata_opens_other_partition() {
        let (mut session, _store) = session();
        assert_eq!(session.state(), SessionState::Idle);

        let reply = session.handle_datagram(&encode_metadata(
            0,
            &Metadata {
                image_size_bytes: 6,
                num_packets: 2,
                image_checksum: 0xC0FF_EE00,
            },
        ));
        assert_eq!(reply, Some(Reply::Ack(0)));
        assert_eq!(session.state(), SessionState::Updating);
        assert!(session.received_metadata());
        assert_eq!(session.num_packets(), 2);
        assert_eq!(session.image_size_bytes(), 6);
        assert_eq!(session.image_checksum(), 0xC0FF_EE00);
        assert_eq!(session.target_partition().unwrap().label.as_str(), "ota_1");
    }

    #[test]
    fn test_metadata_with_nonzero_sequence_is_rejected() {
        let (mut session, _store) = session();
        let datagram = encode_metadata(
            3,
            &Metadata {
                image_size_bytes: 6,
                num_packets: 2,
                image_checksum: 0,
            },
        );
        assert_eq!(session.handle_datagram(&datagram), Some(Reply::Error));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.received_metadata());
    }

    #[test]
    fn test_begin_failure_replies_error() {
        let (mut session, store) = session();
        store.inject(Fault::Begin);
        assert_eq!(session.handle_datagram(&metadata(6, 2)), Some(Reply::Error));
        assert_eq!(session.state(), SessionState::Updating);
        assert!(!session.received_metadata());
        assert!(session.target_partition().is_none());
    }

    #[test]
    fn test_boot_lookup_failure_replies_error() {
        let (mut session, store) = session();
        store.inject(Fault::BootLookup);
        assert_eq!(session.handle_datagram(&metadata(6, 2)), Some(Reply::Error));
        assert!(!session.received_metadata());
    }

    #[test]
    fn test_image_data_with_sequence_zero_is_rejected() {
        let (mut session, _store) = session();
        session.handle_datagram(&metadata(3, 1));
        assert_eq!(session.handle_datagram(&encode_image_data(0, b"abc")), Some(Reply::Error));
        assert_eq!(session.last_sequence_number(), 0);
    }

    #[test]
    fn test_image_data_before_metadata_is_rejected() {
        let (mut session, store) = session();
        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Error));
        assert_eq!(session.last_sequence_number(), 0);
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn test_failed_write_does_not_advance_sequence() {
        let (mut session, store) = session();
        session.handle_datagram(&metadata(6, 2));

        store.inject(Fault::Write);
        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Error));
        assert_eq!(session.last_sequence_number(), 0);

        store.clear_faults();
        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Ack(1)));
        assert_eq!(store.contents("ota_1").unwrap(), b"abc");
    }

    #[test]
    fn test_final_chunk_finalizes_image() {
        let (mut session, store) = session();
        session.handle_datagram(&metadata(6, 2));
        session.handle_datagram(&encode_image_data(1, b"abc"));
        assert_eq!(session.state(), SessionState::Updating);

        assert_eq!(session.handle_datagram(&encode_image_data(2, b"def")), Some(Reply::Ack(2)));
        assert_eq!(session.state(), SessionState::NewImageReady);
        assert!(store.is_finalized("ota_1"));
    }

    #[test]
    fn test_finalize_failure_enters_error_state() {
        let (mut session, store) = session();
        session.handle_datagram(&metadata(3, 1));
        store.inject(Fault::End);

        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Error));
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Error));

        store.clear_faults();
        assert_eq!(session.handle_datagram(&metadata(3, 1)), Some(Reply::Ack(0)));
        assert_eq!(session.state(), SessionState::Updating);
    }

    #[test]
    fn test_image_data_after_image_ready_is_rejected() {
        let (mut session, _store) = session();
        session.handle_datagram(&metadata(3, 1));
        session.handle_datagram(&encode_image_data(1, b"abc"));
        assert_eq!(session.handle_datagram(&encode_image_data(2, b"xyz")), Some(Reply::Error));
        assert_eq!(session.handle_datagram(&encode_image_data(1, b"abc")), Some(Reply::Ack(1)));
        assert_eq!(session.state(), SessionState::NewImageReady);
    }

    #[test]
    fn test_foreign_and_unknown_packets_get_no_reply() {
        let (mut session, _store) = session();
        assert_eq!(session.handle_datagram(b"M-SEARCH * HTTP/1.1\r\n"), None);

        let mut unknown = encode_image_data(1, b"abc");
        unknown[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(session.handle_datagram(&unknown), None);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_select_requires_ready_image() {
        let (mut session, store) = session();
        assert!(!session.select_new_boot_partition());

        session.handle_datagram(&metadata(3, 1));
        assert!(!session.select_new_boot_partition());

        session.handle_datagram(&encode_image_data(1, b"abc"));
        store.inject(Fault::SetBoot);
        assert!(!session.select_new_boot_partition());
        assert_eq!(session.state(), SessionState::NewImageReady);

        store.clear_faults();
        assert!(session.select_new_boot_partition());
        assert_eq!(session.state(), SessionState::NewImageSelected);
        assert_eq!(store.boot_label(), "ota_1");
    }

    #[test]
    fn test_restart_delay_transitions() {
        let (mut session, _store) = session();
        assert!(!session.enter_restart_delay());

        session.handle_datagram(&metadata(3, 1));
        session.handle_datagram(&encode_image_data(1, b"abc"));
        assert!(session.enter_restart_delay());
        assert_eq!(session.state(), SessionState::PreRestartDelay);

        session.leave_restart_delay();
        assert_eq!(session.state(), SessionState::NewImageReady);
    }
}
