//! The pairing-request listener.
//!
//! A single background task that browses for controllers soliciting
//! pairing. The task stays parked on its cancellation signal after the
//! browse call returns, so the active flag observably spans the
//! listener's whole lifetime even when the browse layer is
//! non-blocking. `update` is level-triggered and never stacks a second
//! listener onto a live one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::discovery::{Browser, PairingCallback};

pub struct PairingListener {
    browser: Arc<dyn Browser>,
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl PairingListener {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self {
            browser,
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Reconciles the listener with the desired state: starts it when
    /// listening should happen and none is running, stops it when it
    /// should not.
    pub fn update(&self, should_listen: bool, on_request: PairingCallback) {
        if !should_listen {
            self.stop();
            return;
        }

        // Single-shot: a live listener is left alone.
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.cancel.lock() = Some(cancel_tx);

        let browser = self.browser.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            log::info!("pairing listener started");
            browser.browse_pairing_requests(cancel_rx.clone(), on_request);

            // Park on the cancellation signal; the browse call itself
            // may well have returned immediately.
            let mut cancel_rx = cancel_rx;
            while !*cancel_rx.borrow() {
                if cancel_rx.changed().await.is_err() {
                    break;
                }
            }

            browser.stop();
            active.store(false, Ordering::Release);
            log::info!("pairing listener stopped");
        });
    }

    /// Cancels the browse and lets the listener task wind down.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ManualBrowser;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn update_is_single_shot_while_active() {
        let browser = ManualBrowser::new();
        let listener = PairingListener::new(browser.clone());

        listener.update(true, Arc::new(|_| {}));
        listener.update(true, Arc::new(|_| {}));
        listener.update(true, Arc::new(|_| {}));
        settle().await;

        assert!(listener.is_active());
        assert_eq!(browser.browse_count(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_browse() {
        let browser = ManualBrowser::new();
        let listener = PairingListener::new(browser.clone());

        listener.update(true, Arc::new(|_| {}));
        settle().await;
        assert!(listener.is_active());

        listener.stop();
        settle().await;

        assert!(!listener.is_active());
        assert_eq!(browser.browse_count(), 0);
    }

    #[tokio::test]
    async fn update_with_should_listen_false_stops() {
        let browser = ManualBrowser::new();
        let listener = PairingListener::new(browser.clone());

        listener.update(true, Arc::new(|_| {}));
        settle().await;

        listener.update(false, Arc::new(|_| {}));
        settle().await;

        assert!(!listener.is_active());

        // And it can start again afterwards.
        listener.update(true, Arc::new(|_| {}));
        settle().await;
        assert!(listener.is_active());
    }

    #[tokio::test]
    async fn requests_flow_to_the_callback() {
        let browser = ManualBrowser::new();
        let listener = PairingListener::new(browser.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        listener.update(
            true,
            Arc::new(move |request| {
                let _ = tx.send(request.discriminator);
            }),
        );
        settle().await;

        browser.inject(crate::discovery::PairingRequest {
            discriminator: 1234,
            zone_id: "aabbccdd00112233".to_string(),
            zone_name: "home".to_string(),
        });

        assert_eq!(rx.recv().await, Some(1234));
    }
}
