//! Remote speech service connection
//!
//! # Architecture
//!
//! ```text
//! TransmitTask ──▶ FrameSink ──▶ WebSocket ──▶ speech service
//!                                                   │
//! ReceiveTask ◀── InboundEvent ◀── reader task ◀────┘
//! ```
//!
//! # Retry Strategy
//!
//! Every (re)connect goes through [`connect_with_retry`]: capped attempts with
//! exponential backoff (1s, 2s, ...). Exhaustion is fatal to the session.

mod connection;
pub mod mock;
pub mod protocol;
mod retry;
mod websocket;

pub use connection::{FrameSink, InboundEvent, RemoteConnection, SpeechConnector};
pub use mock::{MockConnector, MockRemote};
pub use protocol::{ClientMessage, ServerMessage, SessionConfig};
pub use retry::{connect_with_retry, RetryPolicy};
pub use websocket::{get_api_key, WsConnector, API_KEY_ENV};
