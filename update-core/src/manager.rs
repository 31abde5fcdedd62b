//! Update manager: the packet handler entry point plus restart coordination.
//!
//! Every datagram is processed under the session lock, so no two packets are ever
//! applied concurrently. The reply for a packet is sent before any restart work
//! begins, which lets the flashing tool see the acknowledgement of the final chunk.
//! A non-zero restart delay runs on its own thread and can be cancelled by
//! clearing auto-restart while it is pending.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::codec::Reply;
use crate::config::SessionOptions;
use crate::partition::{Partition, PartitionStore};
use crate::session::{SessionState, UpdateSession};

const RESTART_TASK_STACK: usize = 6 * 1024;

/// Device reset primitive
pub trait DeviceReset: Send + Sync + 'static {
    /// Reset the device. On hardware this does not return.
    fn reset(&self);
}

/// Cancel handle for one delayed restart task
struct PendingRestart {
    generation: u64,
    cancel: Sender<()>,
}

// Lock order: session, then pending_restart.
struct Shared<S: PartitionStore, R> {
    session: Mutex<UpdateSession<S>>,
    reset: R,
    options: SessionOptions,
    auto_restart: AtomicBool,
    pending_restart: Mutex<Option<PendingRestart>>,
    restart_generation: AtomicU64,
}

pub struct UpdateManager<S: PartitionStore, R> {
    shared: Arc<Shared<S, R>>,
}

impl<S: PartitionStore, R> Clone for UpdateManager<S, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, R> UpdateManager<S, R>
where
    S: PartitionStore + Send + 'static,
    S::Writer: Send,
    R: DeviceReset,
{
    pub fn new(store: S, options: SessionOptions, reset: R) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(UpdateSession::new(store)),
                reset,
                options,
                auto_restart: AtomicBool::new(options.auto_restart),
                pending_restart: Mutex::new(None),
                restart_generation: AtomicU64::new(0),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, UpdateSession<S>> {
        self.shared.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_restart(&self) -> MutexGuard<'_, Option<PendingRestart>> {
        self.shared
            .pending_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> SessionOptions {
        self.shared.options
    }

    pub fn state(&self) -> SessionState {
        self.session().state()
    }

    pub fn target_partition(&self) -> Option<Partition> {
        self.session().target_partition().cloned()
    }

    pub fn last_sequence_number(&self) -> u32 {
        self.session().last_sequence_number()
    }

    pub fn auto_restart(&self) -> bool {
        self.shared.auto_restart.load(Ordering::SeqCst)
    }

    /// Enable or cancel the automatic restart. Cancelling ends a pending delay
    /// and returns the session to `NewImageReady` before this returns.
    pub fn set_auto_restart(&self, enabled: bool) {
        self.shared.auto_restart.store(enabled, Ordering::SeqCst);
        if enabled {
            return;
        }

        let mut session = self.session();
        if let Some(pending) = self.pending_restart().take() {
            let _ = pending.cancel.send(());
            info!("Pending restart cancelled");
            session.leave_restart_delay();
        }
    }

    /// Handle one received datagram and hand the reply bytes to `send`.
    ///
    /// Returns the reply that was sent, or `None` when the datagram was not
    /// answered at all.
    pub fn handle_datagram<F>(&self, datagram: &[u8], send: F) -> Option<Reply>
    where
        F: FnOnce(&[u8]) -> io::Result<()>,
    {
        let (reply, image_ready) = {
            let mut session = self.session();
            let reply = session.handle_datagram(datagram)?;
            (reply, session.state() == SessionState::NewImageReady)
        };

        if let Err(e) = send(reply.encode().as_slice()) {
            warn!("Failed to send {:?} reply: {}", reply, e);
        }

        if image_ready && self.auto_restart() {
            self.begin_auto_restart();
        }

        Some(reply)
    }

    pub fn select_new_boot_partition(&self) -> bool {
        self.session().select_new_boot_partition()
    }

    /// Reset into the selected image. Only returns when the reset is refused or
    /// the reset primitive itself returns.
    pub fn initiate_restart(&self) -> bool {
        let session = self.session();
        if session.state() != SessionState::NewImageSelected {
            warn!("Restart refused in state {:?}", session.state());
            return false;
        }

        if let Some(target) = session.target_partition() {
            info!("Restarting into partition {}", target.label);
        }
        log::logger().flush();
        self.shared.reset.reset();
        true
    }

    fn begin_auto_restart(&self) {
        let delay = self.shared.options.restart_delay();
        let mut session = self.session();
        if delay.is_zero() {
            let ready = self.prepare_restart(&mut session);
            drop(session);
            if ready && !self.initiate_restart() {
                warn!("Restart failed due to cancellation");
            }
            return;
        }

        if !session.enter_restart_delay() {
            return;
        }

        // Replacing an older entry drops its sender, which retires that task
        // without touching the state it no longer owns.
        let generation = self.shared.restart_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancelled) = mpsc::channel();
        *self.pending_restart() = Some(PendingRestart { generation, cancel });
        drop(session);

        info!("Restarting in {} ms unless cancelled", delay.as_millis());
        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name("ota-restart".to_string())
            .stack_size(RESTART_TASK_STACK)
            .spawn(move || manager.wait_and_restart(generation, cancelled, delay));

        if let Err(e) = spawned {
            error!("Failed to start restart task: {}", e);
            let mut session = self.session();
            if self.take_pending_restart(generation) {
                session.leave_restart_delay();
            }
        }
    }

    /// Remove the pending entry if it still belongs to `generation`.
    fn take_pending_restart(&self, generation: u64) -> bool {
        let mut pending = self.pending_restart();
        if pending.as_ref().is_some_and(|p| p.generation == generation) {
            pending.take();
            true
        } else {
            false
        }
    }

    fn wait_and_restart(&self, generation: u64, cancelled: Receiver<()>, delay: Duration) {
        match cancelled.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Restart task {} retired", generation);
                return;
            }
        }

        let mut session = self.session();
        if !self.take_pending_restart(generation) {
            debug!("Restart task {} superseded", generation);
            return;
        }
        let ready = self.prepare_restart(&mut session);
        drop(session);

        if ready && !self.initiate_restart() {
            warn!("Restart failed due to cancellation");
        }
    }

    /// Select the new image for boot when the session still wants a restart.
    fn prepare_restart(&self, session: &mut UpdateSession<S>) -> bool {
        if !self.auto_restart() {
            info!("Auto restart cancelled, keeping current boot partition");
            session.leave_restart_delay();
            return false;
        }

        match session.state() {
            SessionState::PreRestartDelay => session.leave_restart_delay(),
            SessionState::NewImageReady | SessionState::NewImageSelected => {}
            other => {
                info!("Pending restart abandoned in state {:?}", other);
                return false;
            }
        }

        if session.state() == SessionState::NewImageReady && !session.select_new_boot_partition() {
            error!("Could not select new boot partition, restart deferred");
            return false;
        }
        true
    }
}
