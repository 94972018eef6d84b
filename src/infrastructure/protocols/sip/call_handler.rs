//! Call handling (INVITE, ACK, BYE, CANCEL, OPTIONS)
//!
//! Admitted INVITEs become queued sessions. BYE and CANCEL tear them down;
//! the dialog ledger remembers every admitted Call-ID for a while so a late
//! or repeated teardown still gets `200` while a never-admitted one gets `481`.

use super::builder::ResponseBuilder;
use super::handler::{respond, SipHandler};
use super::message::{SipError, SipMethod, SipRequest};
use super::registrar::Registrar;
use super::reporter::ErrorReporter;
use super::transport::ServerTransaction;
use crate::domain::{CallQueue, CallSession, CallSessionState, DomainError, Promotion, Session};
use async_trait::async_trait;
use parking_lot::Mutex;
use rsip::Header;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ALLOWED_METHODS: &str = "REGISTER, INVITE, ACK, BYE, CANCEL, OPTIONS";

/// Who may place calls into the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Any caller
    #[default]
    Open,
    /// Only callers holding a current registration
    Registered,
}

impl FromStr for AdmissionPolicy {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(AdmissionPolicy::Open),
            "registered" => Ok(AdmissionPolicy::Registered),
            other => Err(SipError::InvalidMessage(format!(
                "unknown admission policy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct DialogEntry {
    from_tag: Option<String>,
    to_tag: String,
    terminated_at: Option<Instant>,
}

/// What became of an INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
enum Admission {
    /// Queued under a new dialog
    Admitted { to_tag: String },
    /// Repeat of a live dialog's INVITE
    Retransmission { to_tag: String },
    /// Repeat of a dialog already torn down
    Ended,
    /// Refused with this status
    Refused(u16),
}

/// Ledger of admitted dialogs
pub struct Dialogs {
    entries: Mutex<HashMap<String, DialogEntry>>,
    linger: Duration,
}

impl Dialogs {
    /// `linger` is how long a terminated dialog is still recognised
    pub fn new(linger: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            linger,
        }
    }

    /// Classify an INVITE and, when it opens a new dialog, queue it.
    ///
    /// The ledger lock is held across the queue admission so concurrent
    /// copies of one INVITE resolve to a single dialog.
    fn admit(&self, queue: &CallQueue, session: Arc<CallSession>) -> Result<Admission, SipError> {
        let mut entries = self.entries.lock();
        let call_id = session.id().to_string();

        if let Some(entry) = entries.get(&call_id) {
            if entry.from_tag.as_deref() != session.from_tag() {
                warn!("Call {} is already queued under another dialog", call_id);
                return Ok(Admission::Refused(482));
            }
            return Ok(match entry.terminated_at {
                None => Admission::Retransmission {
                    to_tag: entry.to_tag.clone(),
                },
                Some(_) => Admission::Ended,
            });
        }

        let from_tag = session.from_tag().map(str::to_string);
        match queue.admit(session) {
            Ok(promotion) => {
                if let Some(promotion) = promotion {
                    promotion.current.set_state(CallSessionState::Active);
                    info!("Call {} is now current", call_id);
                } else {
                    info!("Call {} waiting ({} in line)", call_id, queue.waiting_len());
                }
            }
            Err(DomainError::DuplicateSession(_)) => {
                warn!("Call {} is already queued", call_id);
                return Ok(Admission::Refused(482));
            }
            Err(DomainError::QueueFull(capacity)) => {
                warn!("Queue full ({}), rejecting call {}", capacity, call_id);
                return Ok(Admission::Refused(486));
            }
            Err(e) => return Err(SipError::Internal(e.to_string())),
        }

        let to_tag = new_tag();
        entries.insert(
            call_id,
            DialogEntry {
                from_tag,
                to_tag: to_tag.clone(),
                terminated_at: None,
            },
        );
        Ok(Admission::Admitted { to_tag })
    }

    /// Mark a dialog terminated. Returns whether it was ever admitted.
    fn terminate(&self, call_id: &str) -> bool {
        match self.entries.lock().get_mut(call_id) {
            Some(entry) => {
                entry.terminated_at.get_or_insert_with(Instant::now);
                true
            }
            None => false,
        }
    }

    pub fn is_known(&self, call_id: &str) -> bool {
        self.entries.lock().contains_key(call_id)
    }

    pub fn is_terminated(&self, call_id: &str) -> bool {
        self.entries
            .lock()
            .get(call_id)
            .is_some_and(|e| e.terminated_at.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate live dialogs that `is_queued` no longer reports, then forget
    /// dialogs terminated longer than the linger period ago.
    pub fn purge(&self, is_queued: impl Fn(&str) -> bool) -> usize {
        let now = Instant::now();
        let linger = self.linger;
        let mut entries = self.entries.lock();

        for (call_id, entry) in entries.iter_mut() {
            if entry.terminated_at.is_none() && !is_queued(call_id) {
                debug!("Call {} left the queue without a teardown", call_id);
                entry.terminated_at = Some(now);
            }
        }

        let before = entries.len();
        entries.retain(|_, e| {
            e.terminated_at
                .map_or(true, |at| now.duration_since(at) <= linger)
        });
        before - entries.len()
    }
}

/// State shared by the call handlers
pub struct CallControl {
    queue: Arc<CallQueue>,
    dialogs: Dialogs,
    registrar: Arc<Registrar>,
    admission: AdmissionPolicy,
    server_name: String,
    reporter: ErrorReporter,
}

impl CallControl {
    pub fn new(
        queue: Arc<CallQueue>,
        registrar: Arc<Registrar>,
        admission: AdmissionPolicy,
        server_name: impl Into<String>,
        reporter: ErrorReporter,
        dialog_linger: Duration,
    ) -> Self {
        Self {
            queue,
            dialogs: Dialogs::new(dialog_linger),
            registrar,
            admission,
            server_name: server_name.into(),
            reporter,
        }
    }

    pub fn queue(&self) -> &Arc<CallQueue> {
        &self.queue
    }

    pub fn dialogs(&self) -> &Dialogs {
        &self.dialogs
    }

    /// Serve the next waiting call, ending the one it replaces
    pub fn promote(&self) -> Option<Promotion<CallSession>> {
        let promotion = self.queue.promote()?;
        promotion.current.set_state(CallSessionState::Active);
        if let Some(previous) = &promotion.previous {
            previous.set_state(CallSessionState::Terminated);
            self.dialogs.terminate(previous.id());
            info!("Call {} evicted by promotion", previous.id());
        }
        info!("Call {} is now current", promotion.current.id());
        Some(promotion)
    }

    /// Sweep the dialog ledger against the queue
    pub fn purge_dialogs(&self) -> usize {
        self.dialogs
            .purge(|call_id| self.queue.get_session(call_id).is_ok())
    }

    async fn reply(
        &self,
        tx: &dyn ServerTransaction,
        request: &SipRequest,
        method: SipMethod,
        builder: ResponseBuilder,
    ) -> Result<(), SipError> {
        let response = builder
            .server(&self.server_name)
            .build_for_request(request)?;
        respond(tx, response, &self.reporter, method).await;
        Ok(())
    }

    /// Shared BYE/CANCEL path
    async fn tear_down(
        &self,
        request: &SipRequest,
        tx: &dyn ServerTransaction,
        method: SipMethod,
    ) -> Result<(), SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("Missing Call-ID".to_string()))?;
        info!("Received {} for call {}", method, call_id);

        let status = match self.queue.hang_up(&call_id) {
            Ok(hang_up) => {
                hang_up.removed.set_state(CallSessionState::Terminated);
                self.dialogs.terminate(&call_id);
                info!(
                    "Call {} terminated: {} -> {}",
                    call_id,
                    hang_up.removed.caller(),
                    hang_up.removed.callee()
                );
                if let Some(next) = hang_up.promoted {
                    next.set_state(CallSessionState::Active);
                    info!("Call {} is now current", next.id());
                }
                200
            }
            Err(DomainError::SessionNotFound(_)) if self.dialogs.terminate(&call_id) => {
                debug!("Call {} already gone", call_id);
                200
            }
            Err(DomainError::SessionNotFound(_)) => {
                warn!("{} for unknown call {}", method, call_id);
                481
            }
            Err(e) => return Err(SipError::Internal(e.to_string())),
        };

        self.reply(tx, request, method, ResponseBuilder::new(status))
            .await
    }
}

fn new_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// INVITE handler
pub struct InviteHandler {
    control: Arc<CallControl>,
}

impl InviteHandler {
    pub fn new(control: Arc<CallControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SipHandler for InviteHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        let ctl = &self.control;
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("Missing Call-ID".to_string()))?;
        let caller = request
            .from_uri()
            .ok_or_else(|| SipError::InvalidMessage("Missing From header".to_string()))?;
        let callee = request
            .to_uri()
            .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;
        let from_tag = request.from_tag();
        info!("INVITE {} from {} to {}", call_id, caller, callee);

        if ctl.admission == AdmissionPolicy::Registered
            && !ctl.dialogs.is_known(&call_id)
            && !ctl.registrar.is_registered(&caller).await
        {
            warn!("Rejecting call {} from unregistered {}", call_id, caller);
            return ctl
                .reply(tx, &request, SipMethod::Invite, ResponseBuilder::new(403))
                .await;
        }

        let session = Arc::new(CallSession::new(
            call_id.clone(),
            caller,
            callee,
            from_tag,
            tx.source(),
        ));

        match ctl.dialogs.admit(&ctl.queue, session)? {
            Admission::Admitted { to_tag } => {
                ctl.reply(
                    tx,
                    &request,
                    SipMethod::Invite,
                    ResponseBuilder::new(180).to_tag(&to_tag),
                )
                .await?;
                ctl.reply(tx, &request, SipMethod::Invite, ResponseBuilder::ok().to_tag(&to_tag))
                    .await
            }
            Admission::Retransmission { to_tag } => {
                debug!("Retransmitted INVITE for call {}", call_id);
                ctl.reply(tx, &request, SipMethod::Invite, ResponseBuilder::ok().to_tag(&to_tag))
                    .await
            }
            Admission::Ended => {
                debug!("INVITE for call {} after teardown", call_id);
                ctl.reply(tx, &request, SipMethod::Invite, ResponseBuilder::new(487))
                    .await
            }
            Admission::Refused(status) => {
                ctl.reply(tx, &request, SipMethod::Invite, ResponseBuilder::new(status))
                    .await
            }
        }
    }
}

/// ACK handler
pub struct AckHandler {
    control: Arc<CallControl>,
}

impl AckHandler {
    pub fn new(control: Arc<CallControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SipHandler for AckHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        let call_id = request.call_id().unwrap_or_else(|| "unknown".to_string());

        // ACK gets no response
        if self.control.dialogs.is_known(&call_id) {
            debug!("Call {} confirmed", call_id);
        } else {
            debug!("ACK for unknown call {}", call_id);
        }
        Ok(())
    }
}

/// BYE handler
pub struct ByeHandler {
    control: Arc<CallControl>,
}

impl ByeHandler {
    pub fn new(control: Arc<CallControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SipHandler for ByeHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        self.control.tear_down(&request, tx, SipMethod::Bye).await
    }
}

/// CANCEL handler
pub struct CancelHandler {
    control: Arc<CallControl>,
}

impl CancelHandler {
    pub fn new(control: Arc<CallControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SipHandler for CancelHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        self.control.tear_down(&request, tx, SipMethod::Cancel).await
    }
}

/// OPTIONS handler, answered for keepalives
pub struct OptionsHandler {
    server_name: String,
    reporter: ErrorReporter,
}

impl OptionsHandler {
    pub fn new(server_name: impl Into<String>, reporter: ErrorReporter) -> Self {
        Self {
            server_name: server_name.into(),
            reporter,
        }
    }
}

#[async_trait]
impl SipHandler for OptionsHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        let response = ResponseBuilder::ok()
            .server(&self.server_name)
            .header(Header::Other("Allow".into(), ALLOWED_METHODS.into()))
            .build_for_request(&request)?;
        respond(tx, response, &self.reporter, SipMethod::Options).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::header_param;
    use crate::infrastructure::protocols::sip::registrar::tests::{authenticate, registrar};
    use crate::infrastructure::protocols::sip::transport::RecordingTransaction;

    async fn control(admission: AdmissionPolicy, max_waiting: usize) -> Arc<CallControl> {
        let (reporter, _rx) = ErrorReporter::new();
        Arc::new(CallControl::new(
            Arc::new(CallQueue::with_capacity(max_waiting)),
            Arc::new(registrar().await),
            admission,
            "Megaphone-Proxy",
            reporter,
            Duration::from_secs(32),
        ))
    }

    fn request(method: &str, call_id: &str, from_tag: &str) -> SipRequest {
        let raw = format!(
            "{method} sip:queue@host SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK{}\r\n\
             From: <sip:alice@host>;tag={from_tag}\r\n\
             To: <sip:queue@host>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 {method}\r\n\
             Content-Length: 0\r\n\r\n",
            rand::random::<u32>(),
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    async fn invite(handler: &InviteHandler, call_id: &str) -> RecordingTransaction {
        let tx = RecordingTransaction::new();
        handler
            .handle_request(request("INVITE", call_id, "caller"), &tx)
            .await
            .unwrap();
        tx
    }

    fn answered_tag(tx: &RecordingTransaction) -> Option<String> {
        tx.last().headers().iter().find_map(|h| match h {
            Header::To(to) => header_param(rsip::headers::UntypedHeader::value(to), "tag"),
            _ => None,
        })
    }

    async fn bye(handler: &ByeHandler, call_id: &str) -> u16 {
        let tx = RecordingTransaction::new();
        handler
            .handle_request(request("BYE", call_id, "caller"), &tx)
            .await
            .unwrap();
        tx.last().status_code()
    }

    #[tokio::test]
    async fn test_invite_rings_then_answers() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let handler = InviteHandler::new(ctl.clone());

        let tx = invite(&handler, "call-1").await;

        assert_eq!(tx.status_codes(), vec![180, 200]);
        let text = String::from_utf8_lossy(&tx.last().to_bytes()).to_string();
        assert!(text.contains(";tag="));
        assert_eq!(tx.last().server(), Some("Megaphone-Proxy".to_string()));

        let current = ctl.queue().current().unwrap();
        assert_eq!(current.state(), CallSessionState::Active);
        assert_eq!(current.caller(), "sip:alice@host");
    }

    #[tokio::test]
    async fn test_three_invites_then_bye_promotes_next() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let invite_handler = InviteHandler::new(ctl.clone());
        let bye_handler = ByeHandler::new(ctl.clone());

        for id in ["a", "b", "c"] {
            invite(&invite_handler, id).await;
        }
        let snapshot = ctl.queue().snapshot();
        assert_eq!(snapshot.current.as_deref(), Some("a"));
        assert_eq!(snapshot.waiting, vec!["b", "c"]);

        assert_eq!(bye(&bye_handler, "a").await, 200);

        let current = ctl.queue().current().unwrap();
        assert_eq!(current.id(), "b");
        assert_eq!(current.state(), CallSessionState::Active);
        assert_eq!(ctl.queue().snapshot().waiting, vec!["c"]);
    }

    #[tokio::test]
    async fn test_bye_for_never_admitted_call() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let bye_handler = ByeHandler::new(ctl.clone());

        assert_eq!(bye(&bye_handler, "ghost").await, 481);
    }

    #[tokio::test]
    async fn test_repeated_bye_is_idempotent() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let invite_handler = InviteHandler::new(ctl.clone());
        let bye_handler = ByeHandler::new(ctl.clone());

        invite(&invite_handler, "call-1").await;
        assert_eq!(bye(&bye_handler, "call-1").await, 200);
        assert_eq!(bye(&bye_handler, "call-1").await, 200);
        assert!(ctl.queue().current().is_none());
    }

    #[tokio::test]
    async fn test_cancel_removes_waiting_call() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let invite_handler = InviteHandler::new(ctl.clone());
        let cancel_handler = CancelHandler::new(ctl.clone());

        invite(&invite_handler, "first").await;
        invite(&invite_handler, "second").await;

        let tx = RecordingTransaction::new();
        cancel_handler
            .handle_request(request("CANCEL", "second", "caller"), &tx)
            .await
            .unwrap();

        assert_eq!(tx.status_codes(), vec![200]);
        assert_eq!(ctl.queue().waiting_len(), 0);
        assert_eq!(ctl.queue().snapshot().current.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_retransmitted_invite_gets_same_answer() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let handler = InviteHandler::new(ctl.clone());

        let first = invite(&handler, "call-1").await;
        let again = invite(&handler, "call-1").await;

        assert_eq!(again.status_codes(), vec![200]);
        assert_eq!(answered_tag(&first), answered_tag(&again));
        assert_eq!(ctl.queue().waiting_len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_from_other_dialog() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let handler = InviteHandler::new(ctl.clone());

        invite(&handler, "call-1").await;

        let tx = RecordingTransaction::new();
        handler
            .handle_request(request("INVITE", "call-1", "intruder"), &tx)
            .await
            .unwrap();
        assert_eq!(tx.status_codes(), vec![482]);
    }

    #[tokio::test]
    async fn test_full_queue_is_busy() {
        let ctl = control(AdmissionPolicy::Open, 1).await;
        let handler = InviteHandler::new(ctl.clone());

        invite(&handler, "current").await;
        invite(&handler, "waiting").await;
        let tx = invite(&handler, "overflow").await;

        assert_eq!(tx.status_codes(), vec![486]);
        assert!(!ctl.dialogs().is_known("overflow"));
    }

    #[tokio::test]
    async fn test_registered_policy_requires_registration() {
        let ctl = control(AdmissionPolicy::Registered, 8).await;
        let handler = InviteHandler::new(ctl.clone());

        let tx = invite(&handler, "call-1").await;
        assert_eq!(tx.status_codes(), vec![403]);
        assert!(ctl.queue().current().is_none());

        authenticate(&ctl.registrar, "sip:alice@host", "alice", "secret").await;

        let tx = invite(&handler, "call-1").await;
        assert_eq!(tx.status_codes(), vec![180, 200]);
    }

    #[tokio::test]
    async fn test_ack_sends_nothing() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let handler = AckHandler::new(ctl);
        let tx = RecordingTransaction::new();

        handler
            .handle_request(request("ACK", "call-1", "caller"), &tx)
            .await
            .unwrap();
        assert!(tx.status_codes().is_empty());
    }

    #[tokio::test]
    async fn test_options_always_ok() {
        let (reporter, _rx) = ErrorReporter::new();
        let handler = OptionsHandler::new("Megaphone-Proxy", reporter);
        let tx = RecordingTransaction::new();

        handler
            .handle_request(request("OPTIONS", "keepalive", "caller"), &tx)
            .await
            .unwrap();

        assert_eq!(tx.status_codes(), vec![200]);
        let text = String::from_utf8_lossy(&tx.last().to_bytes()).to_string();
        assert!(text.contains("Allow: REGISTER, INVITE"));
    }

    #[tokio::test]
    async fn test_missing_call_id_is_an_error() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let handler = ByeHandler::new(ctl);
        let request = SipRequest::parse(
            b"BYE sip:queue@host SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1\r\n\
              From: <sip:alice@host>;tag=1\r\n\
              To: <sip:queue@host>\r\n\
              CSeq: 2 BYE\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();

        let tx = RecordingTransaction::new();
        let result = handler.handle_request(request, &tx).await;
        assert!(matches!(result, Err(SipError::InvalidMessage(_))));
        assert!(tx.status_codes().is_empty());
    }

    fn queued(call_id: &str) -> Arc<CallSession> {
        Arc::new(CallSession::new(
            call_id,
            "sip:alice@host",
            "sip:queue@host",
            Some("caller".to_string()),
            "10.0.0.2:5060".parse().unwrap(),
        ))
    }

    #[test]
    fn test_purge_ages_out_dialogs_that_left_the_queue() {
        let queue: CallQueue = CallQueue::new();
        let dialogs = Dialogs::new(Duration::ZERO);
        for id in ["live", "done", "vanished"] {
            assert!(matches!(
                dialogs.admit(&queue, queued(id)).unwrap(),
                Admission::Admitted { .. }
            ));
        }

        queue.hang_up("done").unwrap();
        assert!(dialogs.terminate("done"));
        // Left the queue without any teardown reaching the ledger
        queue.remove("vanished").unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let is_queued = |id: &str| queue.get_session(id).is_ok();
        assert_eq!(dialogs.purge(is_queued), 1);
        assert!(dialogs.is_terminated("vanished"));
        assert!(!dialogs.is_terminated("live"));

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(dialogs.purge(is_queued), 1);
        assert!(!dialogs.is_known("vanished"));
        assert!(dialogs.is_known("live"));
        assert_eq!(dialogs.len(), 1);
    }

    #[tokio::test]
    async fn test_invite_after_cancel_is_not_readmitted() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let invite_handler = InviteHandler::new(ctl.clone());
        let cancel_handler = CancelHandler::new(ctl.clone());

        invite(&invite_handler, "c1").await;
        let tx = RecordingTransaction::new();
        cancel_handler
            .handle_request(request("CANCEL", "c1", "caller"), &tx)
            .await
            .unwrap();
        assert_eq!(tx.status_codes(), vec![200]);

        let late = invite(&invite_handler, "c1").await;
        assert_eq!(late.status_codes(), vec![487]);
        assert!(ctl.queue().current().is_none());
        assert_eq!(ctl.queue().waiting_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_copies_of_invite_share_one_dialog() {
        for round in 0..25 {
            let ctl = control(AdmissionPolicy::Open, 8).await;
            let handler = Arc::new(InviteHandler::new(ctl.clone()));
            let call_id = format!("race-{}", round);

            let copies: Vec<_> = (0..2)
                .map(|_| {
                    let handler = handler.clone();
                    let call_id = call_id.clone();
                    tokio::spawn(async move {
                        let tx = RecordingTransaction::new();
                        handler
                            .handle_request(request("INVITE", &call_id, "caller"), &tx)
                            .await
                            .unwrap();
                        (tx.last().status_code(), answered_tag(&tx))
                    })
                })
                .collect();

            let mut answers = Vec::new();
            for copy in copies {
                answers.push(copy.await.unwrap());
            }
            assert_eq!(answers[0].0, 200);
            assert_eq!(answers[0], answers[1]);
            assert_eq!(
                ctl.queue().snapshot().current.as_deref(),
                Some(call_id.as_str())
            );
            assert_eq!(ctl.queue().waiting_len(), 0);
        }
    }

    #[tokio::test]
    async fn test_promote_ends_the_evicted_dialog() {
        let ctl = control(AdmissionPolicy::Open, 8).await;
        let invite_handler = InviteHandler::new(ctl.clone());
        let bye_handler = ByeHandler::new(ctl.clone());

        invite(&invite_handler, "a").await;
        invite(&invite_handler, "b").await;

        let promotion = ctl.promote().unwrap();
        assert_eq!(promotion.current.id(), "b");
        assert_eq!(promotion.previous.unwrap().state(), CallSessionState::Terminated);
        assert!(ctl.dialogs().is_terminated("a"));
        assert!(!ctl.dialogs().is_terminated("b"));

        assert_eq!(bye(&bye_handler, "a").await, 200);
        assert_eq!(ctl.queue().snapshot().current.as_deref(), Some("b"));
        assert!(ctl.promote().is_none());
    }

    #[test]
    fn test_admission_policy_from_str() {
        assert_eq!("open".parse::<AdmissionPolicy>().unwrap(), AdmissionPolicy::Open);
        assert_eq!(
            "Registered".parse::<AdmissionPolicy>().unwrap(),
            AdmissionPolicy::Registered
        );
        assert!("closed".parse::<AdmissionPolicy>().is_err());
    }
}
