// UDP receive loop feeding the update manager
//
// Datagrams are handled one at a time on a single thread; the manager sends
// the reply to the datagram's source before any restart work begins.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use update_core::{DeviceReset, PartitionStore, UpdateManager};

/// Largest datagram accepted; a 1024 byte chunk plus headers fits easily
pub const RECV_BUFFER_LEN: usize = 1500;

const RECEIVER_STACK: usize = 8 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn bind(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .with_context(|| format!("Failed to bind UDP port {}", port))?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(socket)
}

/// Receive and answer datagrams until `running` is cleared
pub fn serve<S, R>(socket: &UdpSocket, manager: &UpdateManager<S, R>, running: &AtomicBool) -> Result<()>
where
    S: PartitionStore + Send + 'static,
    S::Writer: Send,
    R: DeviceReset,
{
    let mut buffer = vec![0u8; RECV_BUFFER_LEN];
    log::info!("Update receiver listening on {}", socket.local_addr()?);

    while running.load(Ordering::Relaxed) {
        let (len, source) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                log::warn!("UDP receive failed: {}", e);
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        log::trace!("{} bytes from {}", len, source);
        manager.handle_datagram(&buffer[..len], |reply| {
            socket.send_to(reply, source).map(|_| ())
        });
    }

    Ok(())
}

/// Running receiver thread and the flag that keeps it serving
pub struct ReceiverHandle {
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ReceiverHandle {
    /// Ask the loop to exit; it notices within one poll interval
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Start the receiver in a background thread
pub fn start<S, R>(socket: UdpSocket, manager: UpdateManager<S, R>) -> Result<ReceiverHandle>
where
    S: PartitionStore + Send + 'static,
    S::Writer: Send,
    R: DeviceReset,
{
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name("ota-rx".to_string())
        .stack_size(RECEIVER_STACK)
        .spawn(move || {
            if let Err(e) = serve(&socket, &manager, &flag) {
                log::error!("Update receiver error: {:?}", e);
            }
        })?;

    Ok(ReceiverHandle { running, thread })
}
