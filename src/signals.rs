//! Latches host signals into control commands.
//!
//! Signal listeners only queue a `ControlCommand`; the control loop drains
//! the queue at the top of each tick, so a signal arriving mid-tick is
//! observed at the next drain point.

use crate::types::{AppError, ControlCommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

pub struct SignalLatch {
    tx: UnboundedSender<ControlCommand>,
    rx: UnboundedReceiver<ControlCommand>,
}

impl Default for SignalLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalLatch {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        SignalLatch { tx, rx }
    }

    /// Handle for queueing commands from outside a signal handler.
    pub fn sender(&self) -> UnboundedSender<ControlCommand> {
        self.tx.clone()
    }

    /// Registers SIGHUP (reload) and SIGINT/SIGTERM (shutdown).
    ///
    /// Must be called from within a tokio runtime. A trap that cannot be
    /// attached is logged; the others still work.
    pub fn listen(&self) -> usize {
        let traps = [
            (SignalKind::hangup(), "HUP", ControlCommand::Reload),
            (SignalKind::interrupt(), "INT", ControlCommand::Shutdown),
            (SignalKind::terminate(), "TERM", ControlCommand::Shutdown),
        ];

        let mut attached = 0;
        for (kind, label, command) in traps {
            match self.forward(kind, label, command) {
                Ok(()) => attached += 1,
                Err(e) => tracing::error!("{}", e),
            }
        }
        attached
    }

    fn forward(
        &self,
        kind: SignalKind,
        label: &'static str,
        command: ControlCommand,
    ) -> Result<(), AppError> {
        let mut stream = signal(kind).map_err(|e| {
            AppError::SignalDispatch(format!("Attaching SIG{} trap failed: {}", label, e))
        })?;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!("Got {} signal, queueing {:?}", label, command);
                if tx.send(command).is_err() {
                    let error =
                        AppError::SignalDispatch(format!("Couldn't dispatch SIG{} trap", label));
                    tracing::error!("{}", error);
                    break;
                }
            }
        });

        Ok(())
    }

    /// Everything latched since the previous drain, oldest first.
    pub fn drain(&mut self) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::error!(
                        "{}",
                        AppError::SignalDispatch("signal queue disconnected".to_string())
                    );
                    break;
                }
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drain_returns_commands_in_order() {
        let mut latch = SignalLatch::new();
        let sender = latch.sender();
        sender.send(ControlCommand::Reload).unwrap();
        sender.send(ControlCommand::Shutdown).unwrap();

        assert_eq!(
            latch.drain(),
            vec![ControlCommand::Reload, ControlCommand::Shutdown]
        );
        assert!(latch.drain().is_empty());
    }

    #[tokio::test]
    async fn hangup_is_latched_as_reload() {
        let mut latch = SignalLatch::new();
        assert_eq!(latch.listen(), 3);

        let pid = std::process::id().to_string();
        let status = std::process::Command::new("kill")
            .args(["-HUP", pid.as_str()])
            .status()
            .unwrap();
        assert!(status.success());

        let commands = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let commands = latch.drain();
                if !commands.is_empty() {
                    return commands;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("SIGHUP was not latched");

        assert_eq!(commands, vec![ControlCommand::Reload]);
    }
}
