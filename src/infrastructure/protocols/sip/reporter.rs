//! Single-slot error reporting for signaling handlers
//!
//! Handlers never block on the error channel: one error may be pending at a
//! time, anything reported while the slot is full is logged and dropped.

use super::message::SipError;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<SipError>,
}

impl ErrorReporter {
    /// Create a reporter and the receiving end of its slot
    pub fn new() -> (Self, mpsc::Receiver<SipError>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn report(&self, err: SipError) {
        warn!("sip proxy error: {}", err);
        if let Err(e) = self.tx.try_send(err) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    error!("error slot full, dropping: {}", dropped);
                }
                mpsc::error::TrySendError::Closed(dropped) => {
                    error!("error slot closed, dropping: {}", dropped);
                }
            }
        }
    }
}
