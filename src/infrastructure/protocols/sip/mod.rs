//! SIP protocol implementation
//!
//! The registrar/proxy side answers REGISTER, INVITE, ACK, BYE, CANCEL and
//! OPTIONS arriving over UDP; the trunk side keeps this gateway registered
//! upstream.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐      ┌─────────────────────────┐
//! │   Registrar / Proxy     │      │   Trunk Registrant      │
//! │ (REGISTER, INVITE, ...) │      │  (outbound REGISTER)    │
//! └───────────┬─────────────┘      └───────────┬─────────────┘
//!             │ ServerTransaction              │ ClientTransport
//! ┌───────────▼────────────────────────────────▼─────────────┐
//! │                  Transport Layer (UDP)                    │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_handler;
pub mod handler;
pub mod message;
pub mod proxy;
pub mod registrar;
pub mod reporter;
pub mod server;
pub mod transport;
pub mod trunk;

pub use auth::{AuthChallenge, AuthorizationHeader, DigestAuth};
pub use call_handler::{
    AckHandler, AdmissionPolicy, ByeHandler, CallControl, CancelHandler, Dialogs, InviteHandler,
    OptionsHandler,
};
pub use handler::SipHandler;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use proxy::{Proxy, ProxyConfig};
pub use registrar::{Registrar, RegistrarConfig, RegistrationState};
pub use reporter::ErrorReporter;
pub use server::{SipServer, SipServerConfig};
pub use transport::{
    ClientTransport, ServerTransaction, SipTimers, TransportProtocol, UdpClientTransport,
    UdpServerTransaction, UdpTransport,
};
pub use trunk::{Credentials, Destination, TrunkConfig, TrunkRegistrant};
