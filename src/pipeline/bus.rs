//! Lifecycle signal bus and the monitor that drives shutdown
//!
//! Stages never report runtime faults through return values on the data
//! path; everything lifecycle-shaped is posted here and consumed by a
//! single control-plane loop.

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Depth of the bus channel; signals are rare and small
pub const BUS_CHANNEL_CAPACITY: usize = 32;

/// Asynchronous lifecycle signal posted by a running stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Aggregate end of stream: the render stage drained its input
    Eos,
    /// Non-fatal condition, logged only
    Warning { source: String, message: String },
    /// Fatal runtime fault, unblocks the monitor
    Error { source: String, message: String },
    /// One merge-stage input finished; informational only
    StreamEos { stream_id: u32 },
}

/// How a monitored run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Terminal EOS (or an external stop request)
    Completed,
    /// Terminal error signal
    Failed { source: String, message: String },
}

/// Consumes bus signals sequentially and blocks until a terminal one.
///
/// `Error` and `Eos` are terminal. `Warning` and `StreamEos` are logged
/// and do not affect control flow: per-stream completion is deliberately
/// not aggregated into an overall-completion decision.
pub struct BusMonitor {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusMonitor {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Run until a terminal signal arrives or `stop` fires.
    ///
    /// An external stop request (ctrl-c) is treated like EOS: the run
    /// completed as far as the operator is concerned.
    pub async fn run(&mut self, stop: &CancellationToken) -> RunOutcome {
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(BusMessage::Eos) => {
                        info!("End of stream");
                        return RunOutcome::Completed;
                    }
                    Some(BusMessage::Error { source, message }) => {
                        error!("ERROR from stage {source}: {message}");
                        return RunOutcome::Failed { source, message };
                    }
                    Some(BusMessage::Warning { source, message }) => {
                        warn!("WARNING from stage {source}: {message}");
                    }
                    Some(BusMessage::StreamEos { stream_id }) => {
                        info!("Got EOS from stream {stream_id}");
                    }
                    // All senders gone without a terminal signal; nothing
                    // further can arrive.
                    None => return RunOutcome::Completed,
                },
                _ = stop.cancelled() => {
                    info!("Stop requested, ending run loop");
                    return RunOutcome::Completed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (mpsc::Sender<BusMessage>, BusMonitor) {
        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        (tx, BusMonitor::new(rx))
    }

    #[tokio::test]
    async fn test_eos_is_terminal() {
        let (tx, mut monitor) = monitor();
        tx.send(BusMessage::Eos).await.unwrap();

        let outcome = monitor.run(&CancellationToken::new()).await;
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_error_is_terminal() {
        let (tx, mut monitor) = monitor();
        tx.send(BusMessage::Error {
            source: "mux".into(),
            message: "boom".into(),
        })
        .await
        .unwrap();

        let outcome = monitor.run(&CancellationToken::new()).await;
        assert!(matches!(outcome, RunOutcome::Failed { source, .. } if source == "mux"));
    }

    #[tokio::test]
    async fn test_warning_and_stream_eos_do_not_unblock() {
        let (tx, mut monitor) = monitor();
        tx.send(BusMessage::Warning {
            source: "infer".into(),
            message: "slow model".into(),
        })
        .await
        .unwrap();
        tx.send(BusMessage::StreamEos { stream_id: 1 }).await.unwrap();
        tx.send(BusMessage::Eos).await.unwrap();

        // The monitor must skip past the non-terminal signals and only
        // return on the EOS.
        let outcome = monitor.run(&CancellationToken::new()).await;
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_stop_token_unblocks() {
        let (_tx, mut monitor) = monitor();
        let stop = CancellationToken::new();
        stop.cancel();

        let outcome = monitor.run(&stop).await;
        assert_eq!(outcome, RunOutcome::Completed);
    }
}
