//! NotificationDispatcher - push alerts on print state transitions
//!
//! ## Responsibilities
//!
//! - Subscribe to the aggregator's transition stream
//! - Render terminal transitions (finished, failed, cancelled, error) into
//!   human-readable messages; routine transitions are suppressed
//! - Deliver each message to every enabled sink, retrying once per sink
//!   before dropping
//!
//! Sinks are built from the notifications document at startup; a missing
//! document means no sinks and the dispatcher idles.

mod repository;
mod sinks;
mod types;

pub use repository::NotifierConfigRepository;
pub use sinks::{build_sinks, NotificationSink, TelegramSink, WhatsAppSink};
pub use types::{NotifierConfig, TelegramConfig, WhatsAppConfig, WhatsAppRecipient};

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::printer_store::PrinterStore;
use crate::status::{PrinterState, StatusAggregator, TransitionEvent};

pub struct NotificationDispatcher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NotificationDispatcher {
    /// Start dispatching transitions to the given sinks. With no sinks the
    /// task still drains the stream so it never lags the channel.
    pub fn spawn(
        aggregator: &StatusAggregator,
        store: Arc<PrinterStore>,
        sinks: Vec<Box<dyn NotificationSink>>,
    ) -> Self {
        let events = aggregator.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(sinks = sinks.len(), "Notification dispatcher starting");
        let task = tokio::spawn(run_dispatch(events, store, sinks, shutdown_rx));
        Self {
            shutdown: shutdown_tx,
            task,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Dispatcher task failed");
            }
        }
        debug!("Notification dispatcher stopped");
    }
}

async fn run_dispatch(
    mut events: broadcast::Receiver<TransitionEvent>,
    store: Arc<PrinterStore>,
    sinks: Vec<Box<dyn NotificationSink>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => handle_transition(&event, &store, &sinks).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Transition stream lagged, notifications skipped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_transition(
    event: &TransitionEvent,
    store: &PrinterStore,
    sinks: &[Box<dyn NotificationSink>],
) {
    let name = display_name(store, &event.printer_id).await;
    let Some(text) = render_message(event, &name) else {
        return;
    };
    info!(printer_id = %event.printer_id, state = %event.next_state, "Dispatching notification");
    for sink in sinks {
        deliver_with_retry(sink.as_ref(), &text).await;
    }
}

/// Printer display name, falling back to the id for printers that have
/// already been removed from the store.
async fn display_name(store: &PrinterStore, printer_id: &str) -> String {
    match store.get(printer_id).await {
        Some(printer) => printer.name,
        None => printer_id.to_string(),
    }
}

/// One delivery attempt plus one retry for transient failures, then the
/// message is dropped.
async fn deliver_with_retry(sink: &dyn NotificationSink, text: &str) {
    for attempt in 1..=2u8 {
        match sink.send(text).await {
            Ok(()) => {
                debug!(sink = sink.name(), "Notification delivered");
                return;
            }
            Err(e) if attempt == 1 && e.is_retryable() => {
                warn!(sink = sink.name(), error = %e, "Notification send failed, retrying once");
            }
            Err(e) => {
                warn!(sink = sink.name(), error = %e, "Notification dropped");
                return;
            }
        }
    }
}

/// Map a transition to its message. `None` for transitions that are not
/// notified (job start, pause, reconnects).
fn render_message(event: &TransitionEvent, printer_name: &str) -> Option<String> {
    let text = match event.next_state {
        PrinterState::Finished => format!("✅ Print completed on {}", printer_name),
        PrinterState::Failed => format!("❌ Print failed on {}", printer_name),
        PrinterState::Cancelled => format!("⚠️ Print cancelled on {}", printer_name),
        PrinterState::Error => format!("⚠️ Printer error: {}", printer_name),
        _ => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer_store::{NewPrinter, PrinterKind};
    use crate::status::StatusUpdate;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct SinkProbe {
        attempts: AtomicUsize,
        fail_times: AtomicUsize,
        delivered: mpsc::UnboundedSender<String>,
    }

    struct ProbeSink(Arc<SinkProbe>);

    impl NotificationSink for ProbeSink {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, crate::error::Result<()>> {
            async move {
                self.0.attempts.fetch_add(1, Ordering::SeqCst);
                if self.0.fail_times.load(Ordering::SeqCst) > 0 {
                    self.0.fail_times.fetch_sub(1, Ordering::SeqCst);
                    return Err(crate::error::Error::Network("synthetic failure".into()));
                }
                let _ = self.0.delivered.send(text.to_string());
                Ok(())
            }
            .boxed()
        }
    }

    fn probe_sink(fail_times: usize) -> (Arc<SinkProbe>, Box<dyn NotificationSink>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(SinkProbe {
            attempts: AtomicUsize::new(0),
            fail_times: AtomicUsize::new(fail_times),
            delivered: tx,
        });
        (Arc::clone(&probe), Box::new(ProbeSink(Arc::clone(&probe))), rx)
    }

    async fn test_store() -> (tempfile::TempDir, Arc<PrinterStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_render_mapping_and_suppression() {
        let event = |next| TransitionEvent {
            printer_id: "printer_x".into(),
            prev_state: PrinterState::Printing,
            next_state: next,
            at: Utc::now(),
        };

        assert_eq!(
            render_message(&event(PrinterState::Finished), "Mini").as_deref(),
            Some("✅ Print completed on Mini")
        );
        assert_eq!(
            render_message(&event(PrinterState::Failed), "Mini").as_deref(),
            Some("❌ Print failed on Mini")
        );
        assert_eq!(
            render_message(&event(PrinterState::Cancelled), "Mini").as_deref(),
            Some("⚠️ Print cancelled on Mini")
        );
        assert_eq!(
            render_message(&event(PrinterState::Error), "Mini").as_deref(),
            Some("⚠️ Printer error: Mini")
        );
        for suppressed in [
            PrinterState::Printing,
            PrinterState::Paused,
            PrinterState::Idle,
            PrinterState::Offline,
        ] {
            assert!(render_message(&event(suppressed), "Mini").is_none());
        }
    }

    #[tokio::test]
    async fn test_terminal_transition_is_delivered() {
        let aggregator = StatusAggregator::new();
        let (_dir, store) = test_store().await;
        let (_probe, sink, mut rx) = probe_sink(0);
        let dispatcher = NotificationDispatcher::spawn(&aggregator, store, vec![sink]);

        aggregator
            .apply_update("printer_x", StatusUpdate::state(PrinterState::Printing))
            .await;
        aggregator
            .apply_update("printer_x", StatusUpdate::state(PrinterState::Finished))
            .await;

        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "✅ Print completed on printer_x");

        // The printing transition was suppressed, nothing else arrives.
        assert!(rx.try_recv().is_err());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_failure_is_retried() {
        let aggregator = StatusAggregator::new();
        let (_dir, store) = test_store().await;
        let (probe, sink, mut rx) = probe_sink(1);
        let dispatcher = NotificationDispatcher::spawn(&aggregator, store, vec![sink]);

        aggregator
            .apply_update("printer_x", StatusUpdate::state(PrinterState::Failed))
            .await;

        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "❌ Print failed on printer_x");
        assert_eq!(probe.attempts.load(Ordering::SeqCst), 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_failures_drop_the_message() {
        let aggregator = StatusAggregator::new();
        let (_dir, store) = test_store().await;
        let (probe, sink, mut rx) = probe_sink(2);
        let dispatcher = NotificationDispatcher::spawn(&aggregator, store, vec![sink]);

        aggregator
            .apply_update("printer_x", StatusUpdate::state(PrinterState::Cancelled))
            .await;
        // A later event proves the first was dropped, not delayed.
        aggregator
            .apply_update("printer_x", StatusUpdate::state(PrinterState::Finished))
            .await;

        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "✅ Print completed on printer_x");
        assert!(rx.try_recv().is_err());
        assert_eq!(probe.attempts.load(Ordering::SeqCst), 3);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_display_name_comes_from_store() {
        let aggregator = StatusAggregator::new();
        let (_dir, store) = test_store().await;
        let printer = store
            .add(NewPrinter {
                name: "Kitchen Voron".into(),
                kind: PrinterKind::GenericMjpeg,
                address: "10.0.0.9".into(),
                secret: None,
                serial: None,
                mqtt_port: None,
                stream_url_template: None,
                api_url: None,
                relay_port: None,
            })
            .await
            .unwrap();

        let (_probe, sink, mut rx) = probe_sink(0);
        let dispatcher = NotificationDispatcher::spawn(&aggregator, Arc::clone(&store), vec![sink]);

        aggregator
            .apply_update(&printer.id, StatusUpdate::state(PrinterState::Error))
            .await;

        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "⚠️ Printer error: Kitchen Voron");

        dispatcher.shutdown().await;
    }
}
