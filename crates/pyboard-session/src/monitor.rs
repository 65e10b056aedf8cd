//! Periodic serial port polling.
//!
//! Publishes the sorted set of visible ports and cancels the active
//! session's loss token as soon as its port drops out of that set. The
//! monitor never queues work on the session worker, so a long-running
//! operation cannot delay detection.

use std::time::Duration;

use pyboard_core::{OutputRouter, PortLister};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::session::SessionStatus;

pub struct PortMonitor {
    ports: watch::Receiver<Vec<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PortMonitor {
    /// Start polling `lister` every `interval`.
    ///
    /// `status` is usually [`SessionManager::subscribe_status`].
    ///
    /// [`SessionManager::subscribe_status`]: crate::SessionManager::subscribe_status
    #[must_use]
    pub fn spawn<L>(
        lister: L,
        status: watch::Receiver<SessionStatus>,
        router: OutputRouter,
        interval: Duration,
    ) -> Self
    where
        L: PortLister + 'static,
    {
        let (ports_tx, ports) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll(
            lister,
            status,
            router,
            ports_tx,
            interval,
            cancel.clone(),
        ));

        Self {
            ports,
            cancel,
            task: Some(task),
        }
    }

    /// Receiver for the visible port set.
    #[must_use]
    pub fn ports(&self) -> watch::Receiver<Vec<String>> {
        self.ports.clone()
    }

    #[must_use]
    pub fn current_ports(&self) -> Vec<String> {
        self.ports.borrow().clone()
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll<L: PortLister>(
    lister: L,
    status: watch::Receiver<SessionStatus>,
    router: OutputRouter,
    ports_tx: watch::Sender<Vec<String>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let listed = tokio::select! {
            () = cancel.cancelled() => break,
            listed = lister.list_ports() => listed,
        };
        let mut ports = match listed {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!("Port enumeration failed: {e}");
                continue;
            }
        };
        ports.sort();
        ports.dedup();

        check_session(&status.borrow(), &ports, &router);

        ports_tx.send_if_modified(|current| {
            if *current == ports {
                return false;
            }
            tracing::debug!(?ports, "Port set changed");
            *current = ports;
            true
        });
    }
    tracing::debug!("Port monitor stopped");
}

fn check_session(status: &SessionStatus, ports: &[String], router: &OutputRouter) {
    if !status.is_connected() {
        return;
    }
    let (Some(port), Some(lost)) = (status.port.as_deref(), status.lost.as_ref()) else {
        return;
    };
    if lost.is_cancelled() || ports.iter().any(|p| p == port) {
        return;
    }
    tracing::warn!(port, "Bound port disappeared");
    router.error(format!("Port {port} is no longer available"));
    lost.cancel();
}

#[cfg(test)]
mod tests {
    use pyboard_core::SimulatedBoard;

    use super::*;

    #[tokio::test]
    async fn publishes_sorted_port_changes() {
        let board = SimulatedBoard::with_ports(["/dev/ttyUSB0", "/dev/ttyACM0"]);
        let (_status_tx, status) = watch::channel(SessionStatus::default());
        let (router, log, _console) = OutputRouter::buffered();
        let mut monitor =
            PortMonitor::spawn(board.clone(), status, router, Duration::from_millis(10));
        let mut ports = monitor.ports();

        tokio::time::timeout(Duration::from_secs(1), ports.wait_for(|p| p.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.current_ports(), vec!["/dev/ttyACM0", "/dev/ttyUSB0"]);

        board.unplug("/dev/ttyUSB0");
        tokio::time::timeout(Duration::from_secs(1), ports.wait_for(|p| p.len() == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monitor.current_ports(), vec!["/dev/ttyACM0"]);
        assert!(log.snapshot().is_empty());

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn ignores_sessions_that_are_not_connected() {
        let token = CancellationToken::new();
        let status = SessionStatus {
            port: Some("/dev/ttyACM0".to_string()),
            lost: Some(token.clone()),
            ..SessionStatus::default()
        };
        let (router, _log, _console) = OutputRouter::buffered();
        check_session(&status, &[], &router);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancels_token_when_bound_port_vanishes() {
        let token = CancellationToken::new();
        let status = SessionStatus {
            state: crate::session::SessionState::Connected,
            port: Some("/dev/ttyACM0".to_string()),
            lost: Some(token.clone()),
            ..SessionStatus::default()
        };
        let (router, log, _console) = OutputRouter::buffered();

        check_session(&status, &["/dev/ttyACM0".to_string()], &router);
        assert!(!token.is_cancelled());

        check_session(&status, &["/dev/ttyUSB0".to_string()], &router);
        assert!(token.is_cancelled());
        assert!(log.snapshot_text().contains("/dev/ttyACM0 is no longer available"));
    }
}
