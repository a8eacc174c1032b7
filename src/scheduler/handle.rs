//! Control channel to a running scheduler loop.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::{SchedulerCommand, SchedulerError, TickSummary};

/// Buffer size for the command channel between the scheduler and its loop.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Owned by the scheduler while the loop is running.
pub(crate) struct LoopHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) join: JoinHandle<()>,
}

/// Send a command that returns a result and wait for the response.
pub(crate) async fn send_result_command<T>(
    command_tx: &mpsc::Sender<SchedulerCommand>,
    build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
    operation: &str,
) -> Result<T, SchedulerError>
where
    T: Send + 'static,
{
    let (response_tx, response_rx) = oneshot::channel();
    command_tx
        .send(build_command(response_tx))
        .await
        .map_err(|_| {
            SchedulerError::ChannelError(format!("failed to send {} command", operation))
        })?;

    response_rx.await.map_err(|_| {
        SchedulerError::ChannelError(format!("failed to receive {} response", operation))
    })?
}

impl LoopHandle {
    /// Ask the loop to evaluate a tick now.
    pub(crate) async fn run_now(
        command_tx: &mpsc::Sender<SchedulerCommand>,
    ) -> Result<TickSummary, SchedulerError> {
        send_result_command(
            command_tx,
            |response| SchedulerCommand::RunNow { response },
            "run_now",
        )
        .await
    }

    /// Signal shutdown and wait until the loop task has exited.
    pub(crate) async fn shutdown(self) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(SchedulerCommand::Shutdown {
                response: response_tx,
            })
            .await;

        // A loop that already exited has dropped its receiver; joining is
        // still required either way.
        if sent.is_ok() {
            let _ = response_rx.await;
        }

        self.join
            .await
            .map_err(|e| SchedulerError::ChannelError(format!("scheduler loop panicked: {}", e)))
    }
}
