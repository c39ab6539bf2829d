// ABOUTME: Server-facing side of fieldlog: the SyncTransport trait and its reqwest implementation.
// ABOUTME: Also owns the wire format (job body, response parsing, server job conversion).

pub mod http;
pub mod testing;
pub mod transport;
pub mod wire;

pub use http::HttpTransport;
pub use testing::{RecordedPost, ScriptedTransport};
pub use transport::{SyncTransport, TransportError, TransportResponse};
pub use wire::{SyncOutcome, classify_response, job_body, job_from_server, recent_jobs};
