//! Gateway session lifecycle
//!
//! Owns everything one run of the relay needs: the daemon supervisor, the
//! shutdown token, the outbox and the transport tasks. Start order is
//! daemon → socket → loops; stop runs in reverse.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::Config;
use crate::context::ConversationManager;
use crate::persona::Persona;
use crate::providers::{ChatBackend, ImageBackend};
use crate::router::MessageRouter;
use crate::signal::transport::CONNECT_TIMEOUT;
use crate::signal::{
    DaemonState, DaemonSupervisor, EnvelopeHandler, Outbox, Transport, TransportTasks,
};

/// How long `stop` waits for the reader loop
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits for the writer loop
const WRITER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running relay
pub struct GatewaySession {
    supervisor: DaemonSupervisor,
    shutdown: CancellationToken,
    outbox: Outbox,
    tasks: Option<TransportTasks>,
}

impl GatewaySession {
    /// Validate config, launch the daemon, connect and start routing
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the daemon fails to
    /// start, or the socket cannot be reached. A daemon that started is
    /// stopped again before the error is returned.
    pub async fn start(
        config: &Config,
        persona: &Persona,
        chat: Arc<dyn ChatBackend>,
        images: Arc<dyn ImageBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let mut supervisor = DaemonSupervisor::new();
        supervisor.start(&config.daemon_spec()).await?;

        let transport =
            match Transport::connect(&config.signal.daemon_address, CONNECT_TIMEOUT).await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::error!(error = %e, "daemon started but its socket is unreachable");
                    supervisor.stop().await;
                    return Err(e);
                }
            };

        let conversations = ConversationManager::new(
            persona.system_prompt(),
            chat,
            config.context.clone(),
        );
        let identity = config.signal.account.clone();

        tracing::info!(
            account = %identity,
            persona = persona.name(),
            images = images.name(),
            "relay session started"
        );

        Ok(Self::attach(supervisor, transport, move |outbox| {
            MessageRouter::new(identity, conversations, images, outbox)
        }))
    }

    /// Start the loops over an already connected transport
    ///
    /// `handler` receives the outbox replies should be pushed to.
    pub fn attach<F, H>(supervisor: DaemonSupervisor, transport: Transport, handler: F) -> Self
    where
        F: FnOnce(Outbox) -> H,
        H: EnvelopeHandler + 'static,
    {
        let shutdown = CancellationToken::new();
        let (outbox, receiver) = Outbox::channel();
        let handler = handler(outbox.clone());

        tracing::debug!(peer = transport.peer(), "starting transport loops");
        let tasks = transport.spawn(handler, receiver, shutdown.clone());

        Self {
            supervisor,
            shutdown,
            outbox,
            tasks: Some(tasks),
        }
    }

    /// Queue used for replies
    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// State of the supervised daemon
    #[must_use]
    pub const fn daemon_state(&self) -> DaemonState {
        self.supervisor.state()
    }

    /// Whether shutdown has been requested or the connection dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session begins shutting down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stop loops, then the daemon
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        self.outbox.close();

        if let Some(tasks) = self.tasks.take() {
            join_within("reader", tasks.reader, READER_JOIN_TIMEOUT).await;
            if let Some(written) = join_within("writer", tasks.writer, WRITER_JOIN_TIMEOUT).await {
                tracing::debug!(written, "writer drained");
            }
        }

        self.supervisor.stop().await;
        tracing::info!("relay session stopped");
    }
}

/// Await a task for at most `timeout`, aborting it afterwards
async fn join_within<T>(name: &str, handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(task = name, error = %e, "task ended abnormally");
            None
        }
        Err(_) => {
            tracing::warn!(task = name, "task did not stop in time, aborting");
            abort.abort();
            None
        }
    }
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("daemon", &self.supervisor.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
