//! Shared helpers for unit tests.
//!
//! `LogCapture` records every tracing event emitted on the current thread. The
//! subscriber is installed globally once so callsite interest is never cached
//! as disabled by a test that runs without one.

use std::sync::{Mutex, Once, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;

use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::channel::ChannelConfig;

/// Short timeouts so failure paths finish quickly.
pub(crate) fn fast_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_ack_timeout(Duration::from_secs(2))
        .with_drain_item_timeout(Duration::from_millis(20))
}

fn events() -> &'static Mutex<Vec<(ThreadId, String)>> {
    static EVENTS: OnceLock<Mutex<Vec<(ThreadId, String)>>> = OnceLock::new();
    EVENTS.get_or_init(|| Mutex::new(Vec::new()))
}

struct CaptureLayer;

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("[{}] {}", event.metadata().target(), visitor.message);
        if let Ok(mut events) = events().lock() {
            events.push((std::thread::current().id(), line));
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Log lines recorded on the installing thread since `install`.
pub(crate) struct LogCapture {
    thread: ThreadId,
}

impl LogCapture {
    pub(crate) fn install() -> Self {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::registry().with(CaptureLayer).try_init();
        });

        let thread = std::thread::current().id();
        if let Ok(mut events) = events().lock() {
            events.retain(|(t, _)| *t != thread);
        }
        Self { thread }
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        events()
            .lock()
            .map(|events| {
                events
                    .iter()
                    .any(|(t, line)| *t == self.thread && line.contains(needle))
            })
            .unwrap_or(false)
    }
}
