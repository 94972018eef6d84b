//! SIP message handlers

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::reporter::ErrorReporter;
use super::transport::ServerTransaction;
use async_trait::async_trait;
use tracing::debug;

/// Trait for handling SIP requests
#[async_trait]
pub trait SipHandler: Send + Sync {
    /// Handle a SIP request, answering through `tx`.
    ///
    /// An `Err` means no final response was sent; the server answers it.
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError>;
}

/// Send a response, routing a send failure to the error reporter.
///
/// Returns whether the response went out.
pub async fn respond(
    tx: &dyn ServerTransaction,
    response: SipResponse,
    reporter: &ErrorReporter,
    method: SipMethod,
) -> bool {
    let status = response.status_code();
    match tx.respond(response).await {
        Ok(()) => {
            debug!("Sent {} for {} to {}", status, method, tx.source());
            true
        }
        Err(e) => {
            reporter.report(SipError::TransportError(format!(
                "could not respond to {}: {}",
                method, e
            )));
            false
        }
    }
}
