//! Background task that expires idle sessions and reacts to teardown events.

use crate::manager::SessionManager;
use crate::registry::ContainerEvent;
use crate::session::SessionClosed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    /// Sessions idle for longer than this are stopped.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

/// Spawn the reaper. It runs until `shutdown` is cancelled.
///
/// Besides the periodic idle sweep it stops sessions as soon as their container is
/// destroyed or their subprocess exits.
pub fn spawn_idle_reaper(
    manager: Arc<SessionManager>,
    settings: ReaperSettings,
    container_events: broadcast::Receiver<ContainerEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let closed_notices = manager.take_closed_notices();
    if closed_notices.is_none() {
        tracing::warn!("session close notices already consumed; relying on idle sweep");
    }

    tokio::spawn(async move {
        let mut container_events = Some(container_events);
        let mut closed_notices = closed_notices;

        let mut tick = tokio::time::interval(settings.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let expired = manager.expire_idle(settings.idle_timeout).await;
                    if expired > 0 {
                        tracing::info!(expired, "idle sweep expired sessions");
                    }
                }
                event = next_container_event(&mut container_events) => {
                    match event {
                        Some(ContainerEvent::Destroyed { container_id }) => {
                            let expired = manager.expire_all_for(&container_id).await;
                            tracing::info!(
                                container_id = %container_id,
                                expired,
                                "container sessions torn down"
                            );
                        }
                        None => {
                            let expired = manager.expire_orphans().await;
                            if expired > 0 {
                                tracing::info!(expired, "expired sessions of missing containers");
                            }
                        }
                    }
                }
                Some(notice) = next_closed_notice(&mut closed_notices) => {
                    manager.expire(&notice.key, &notice.reason).await;
                }
            }
        }

        tracing::debug!("idle reaper stopped");
    })
}

/// Next teardown event. `None` means events were missed and a reconcile pass is due.
///
/// Pends forever once the bus is gone.
async fn next_container_event(
    rx: &mut Option<broadcast::Receiver<ContainerEvent>>,
) -> Option<ContainerEvent> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "missed container events; reconciling with registry");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            std::future::pending().await
        }
    }
}

async fn next_closed_notice(
    rx: &mut Option<mpsc::UnboundedReceiver<SessionClosed>>,
) -> Option<SessionClosed> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let notice = receiver.recv().await;
    if notice.is_none() {
        *rx = None;
    }
    notice
}
