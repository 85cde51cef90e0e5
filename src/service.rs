pub mod articles;
pub mod auto_bid;
pub mod groups;
pub mod messaging;
pub mod popup;

use crate::storage::ChangeNotification;
use anyhow::{format_err, Result};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// A service that is a loop that does something every `interval`
#[async_trait]
pub trait LoopService: Send {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run_iteration(&mut self) -> Result<()>;
}

/// A service that reacts to storage change notifications
#[async_trait]
pub trait ChangeFollowerService: Send {
    fn name(&self) -> &'static str;

    async fn handle_change(&mut self, change: ChangeNotification) -> Result<()>;
}

/// Service execution control instance
///
/// All services are basically a loop that lives as long as the window. A
/// failing iteration is logged and the loop carries on; only `stop_all`
/// ends them.
#[derive(Clone)]
pub struct ServiceControl {
    stop_all: Arc<watch::Sender<bool>>,
}

impl Default for ServiceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceControl {
    pub fn new() -> Self {
        Self {
            stop_all: Arc::new(watch::channel(false).0),
        }
    }

    pub fn stop_all(&self) {
        self.stop_all.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_all.borrow()
    }

    pub fn spawn_loop(&self, mut service: impl LoopService + 'static) -> JoinHandle {
        let mut stop = self.stop_all.subscribe();

        JoinHandle::new(tokio::spawn(async move {
            let name = service.name();
            let interval = service.interval();

            while !*stop.borrow() {
                tokio::select! {
                    res = service.run_iteration() => {
                        if let Err(e) = res {
                            warn!(service = name, error = %e, "iteration failed");
                        }
                    }
                    _ = stop.changed() => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.changed() => break,
                }
            }
            debug!(service = name, "stopped");
            Ok(())
        }))
    }

    pub fn spawn_change_follower(
        &self,
        mut service: impl ChangeFollowerService + 'static,
        mut changes: broadcast::Receiver<ChangeNotification>,
    ) -> JoinHandle {
        let mut stop = self.stop_all.subscribe();

        JoinHandle::new(tokio::spawn(async move {
            let name = service.name();

            while !*stop.borrow() {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if let Err(e) = service.handle_change(change).await {
                                warn!(service = name, error = %e, "handling change failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(service = name, skipped, "missed change notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.changed() => break,
                }
            }
            debug!(service = name, "stopped");
            Ok(())
        }))
    }
}

/// Task handle that aborts the task on drop
pub struct JoinHandle {
    task: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl JoinHandle {
    fn new(task: tokio::task::JoinHandle<Result<()>>) -> Self {
        Self { task: Some(task) }
    }

    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| format_err!("service task failed: {}", e))?,
            None => Ok(()),
        }
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
