use tokio::sync::watch;

/// Process-wide stop signal. Every long-lived task holds a listener.
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownListener) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownListener { receiver })
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownListener {
    /// Resolves once shutdown is triggered, immediately if it already was.
    pub async fn notified(&mut self) {
        if *self.receiver.borrow() {
            return;
        }
        let _ = self.receiver.changed().await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub fn install_signal_handlers(shutdown: Shutdown) {
    let ctrlc = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "lifecycle", "received Ctrl-C");
            ctrlc.trigger();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let term = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                tracing::info!(target: "lifecycle", "received SIGTERM");
                term.trigger();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn late_subscribers_see_the_trigger() {
        let (shutdown, mut early) = Shutdown::new();
        assert!(!early.is_triggered());

        shutdown.trigger();
        let mut late = shutdown.subscribe();
        assert!(late.is_triggered());

        tokio::time::timeout(Duration::from_secs(1), early.notified())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waiting_listener_wakes_on_trigger() {
        let (shutdown, mut listener) = Shutdown::new();
        let waiter = tokio::spawn(async move {
            listener.notified().await;
            listener.is_triggered()
        });
        tokio::task::yield_now().await;
        shutdown.trigger();
        assert!(waiter.await.unwrap());
    }
}
