// ABOUTME: Watches network and app-lifecycle signals and wakes the sync drain on favourable edges.
// ABOUTME: Fires on Offline -> Online and Background -> Foreground; holds no other state.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Reconnected,
    Foregrounded,
}

/// Background task bridging platform signals to the engine.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Spawn a monitor that calls `on_wake` on every favourable transition.
    /// The monitor exits once both senders are dropped.
    pub fn spawn<F, Fut>(
        mut network: watch::Receiver<NetworkState>,
        mut app: watch::Receiver<AppState>,
        mut on_wake: F,
    ) -> Self
    where
        F: FnMut(WakeReason) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut last_network = *network.borrow_and_update();
            let mut last_app = *app.borrow_and_update();
            let mut network_open = true;
            let mut app_open = true;

            while network_open || app_open {
                tokio::select! {
                    changed = network.changed(), if network_open => {
                        if changed.is_err() {
                            network_open = false;
                            continue;
                        }
                        let now = *network.borrow_and_update();
                        let edge = last_network == NetworkState::Offline && now == NetworkState::Online;
                        last_network = now;
                        if edge {
                            tracing::info!("network reconnected, waking sync");
                            on_wake(WakeReason::Reconnected).await;
                        }
                    }
                    changed = app.changed(), if app_open => {
                        if changed.is_err() {
                            app_open = false;
                            continue;
                        }
                        let now = *app.borrow_and_update();
                        let edge = last_app == AppState::Background && now == AppState::Foreground;
                        last_app = now;
                        if edge {
                            tracing::info!("app foregrounded, waking sync");
                            on_wake(WakeReason::Foregrounded).await;
                        }
                    }
                }
            }
            tracing::debug!("connectivity signals closed, monitor exiting");
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
