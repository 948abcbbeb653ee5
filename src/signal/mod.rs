//! signal-cli daemon integration
//!
//! The daemon is spawned as a child process listening on a local TCP socket
//! and speaks newline-delimited JSON-RPC.
//! See: <https://github.com/AsamK/signal-cli/wiki/JSON-RPC-service>

mod envelope;
mod outbox;
pub mod rpc;
mod supervisor;
pub mod transport;

pub use envelope::{Envelope, EnvelopeKind, Frame, RpcError, parse_frame};
pub use outbox::{Dequeued, Outbound, Outbox, OutboxReceiver, SendTask};
pub use supervisor::{DaemonSpec, DaemonState, DaemonSupervisor, ProcessHandle};
pub use transport::{EnvelopeHandler, Transport, TransportTasks};
