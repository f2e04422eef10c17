//! Graceful shutdown coordination.
//!
//! The server announces shutdown by broadcasting `true` on the
//! `box.shutdown` watcher key. From then on the connection refuses new
//! requests, lets in-flight ones finish, and closes itself once nothing is
//! pending. Requests still pending when the socket goes away first fail with
//! [`ClientError::FinishedByShutdown`].

use crate::error::{ClientError, CloseCause};
use iproto_protocol::{Event, Value, SHUTDOWN_EVENT_KEY};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub(crate) struct ShutdownCoordinator {
    notice: AtomicBool,
    draining: AtomicBool,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns whether `event` is the server's shutdown announcement.
    pub(crate) fn is_notice(event: &Event) -> bool {
        event.key == SHUTDOWN_EVENT_KEY && event.data == Value::Boolean(true)
    }

    /// Records a shutdown notice. Returns `true` for the first notice only.
    pub(crate) fn record_notice(&self) -> bool {
        !self.notice.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn notice_received(&self) -> bool {
        self.notice.load(Ordering::SeqCst)
    }

    /// Claims the drain. Returns `true` for the first caller only.
    pub(crate) fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    /// Cause and pending-request error for a socket that went away.
    pub(crate) fn remote_close(&self) -> (CloseCause, ClientError) {
        if self.notice_received() {
            (CloseCause::Shutdown, ClientError::FinishedByShutdown)
        } else {
            (CloseCause::Server, ClientError::Closed(CloseCause::Server))
        }
    }
}
