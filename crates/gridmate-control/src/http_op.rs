use crate::error::ControlError;
use crate::transport::{HttpRequest, HttpTransport, TransportError, TransportResult};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Single-flight wrapper around one transport-level exchange.
///
/// Owns at most one outstanding operation. `start` fails with
/// [`ControlError::Busy`] while an operation is in flight; there is no
/// queueing; a second start while busy is a caller error. The outcome is
/// delivered exactly once, by the `poll` call that observes completion.
/// Must be used from within a tokio runtime.
pub struct HttpOpChannel {
    transport: Arc<dyn HttpTransport>,
    in_flight: Option<oneshot::Receiver<TransportResult>>,
}

impl HttpOpChannel {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            in_flight: None,
        }
    }

    /// True while an operation is outstanding.
    pub fn busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Begin a new exchange. The request runs on a detached task; check
    /// `poll()` on later ticks for the outcome.
    pub fn start(&mut self, req: HttpRequest) -> Result<(), ControlError> {
        if self.in_flight.is_some() {
            return Err(ControlError::Busy);
        }
        let fut = self.transport.execute(req);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        self.in_flight = Some(rx);
        Ok(())
    }

    /// Non-blocking completion check. Returns `Some` exactly once per
    /// started operation, after which the channel is idle again.
    pub fn poll(&mut self) -> Option<TransportResult> {
        let rx = self.in_flight.as_mut()?;
        match rx.try_recv() {
            Ok(outcome) => {
                self.in_flight = None;
                Some(outcome)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                self.in_flight = None;
                Some(Err(TransportError::Canceled))
            }
        }
    }

    /// Abandon the in-flight operation, if any. The transport future is
    /// left to finish on its own; its result is discarded.
    pub fn cancel(&mut self) {
        self.in_flight = None;
    }
}
