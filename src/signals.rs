/// Interrupt handling.
///
/// Ctrl-C does not terminate the runner directly. It bumps a generation
/// counter that every in-flight monitor watches through its own `Interrupt`
/// handle; the monitor then kills its child and hands the decision (fail the
/// test and continue, or abort the run) back to the driver.
use std::sync::Arc;
use tokio::sync::watch;

pub struct SignalHandler {
    tx: Arc<watch::Sender<u64>>,
}

impl SignalHandler {
    /// Handler with no OS hook; interrupts only come from `trigger`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Listen for Ctrl-C for the rest of the process lifetime.
    pub fn install() -> Self {
        let handler = Self::new();
        let tx = Arc::clone(&handler.tx);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                    break;
                }
                tracing::debug!("interrupt received");
                tx.send_modify(|generation| *generation += 1);
            }
        });
        handler
    }

    /// A handle that fires on interrupts raised after this call.
    pub fn subscribe(&self) -> Interrupt {
        Interrupt {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of interrupts raised so far.
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn trigger(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Interrupt {
    rx: watch::Receiver<u64>,
}

impl Interrupt {
    /// A handle that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(0);
        Self { rx }
    }

    /// Non-blocking check. Consumes a pending interrupt and returns true.
    pub fn take_pending(&mut self) -> bool {
        match self.rx.has_changed() {
            Ok(true) => {
                self.rx.borrow_and_update();
                true
            }
            _ => false,
        }
    }

    /// Resolve on the next interrupt. Pends forever once the handler is gone.
    pub async fn wait(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_subscriber() {
        let handler = SignalHandler::new();
        let mut interrupt = handler.subscribe();
        handler.trigger();
        tokio::time::timeout(Duration::from_secs(1), interrupt.wait())
            .await
            .expect("interrupt should fire");
    }

    #[tokio::test]
    async fn test_earlier_interrupts_are_not_replayed() {
        let handler = SignalHandler::new();
        handler.trigger();
        let mut interrupt = handler.subscribe();
        let waited = tokio::time::timeout(Duration::from_millis(50), interrupt.wait()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_generation_counts_triggers() {
        let handler = SignalHandler::new();
        assert_eq!(handler.generation(), 0);
        handler.trigger();
        handler.trigger();
        assert_eq!(handler.generation(), 2);
    }

    #[test]
    fn test_take_pending_consumes_once() {
        let handler = SignalHandler::new();
        let mut interrupt = handler.subscribe();
        assert!(!interrupt.take_pending());
        handler.trigger();
        assert!(interrupt.take_pending());
        assert!(!interrupt.take_pending());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut interrupt = Interrupt::never();
        let waited = tokio::time::timeout(Duration::from_millis(50), interrupt.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_each_handle_sees_the_interrupt() {
        let handler = SignalHandler::new();
        let mut a = handler.subscribe();
        let mut b = a.clone();
        handler.trigger();
        tokio::time::timeout(Duration::from_secs(1), a.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.wait())
            .await
            .unwrap();
    }
}
