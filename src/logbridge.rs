// =============================================================================
// Log Bridge — tracing layer that mirrors WARN/ERROR records onto the bus
// =============================================================================
//
// Installed next to the fmt layer at startup. Anything a component logs at
// WARN or above becomes a `SystemLog` event, so dashboard clients see the
// same degradations an operator would see in the terminal. Bus publishing
// is synchronous and never blocks, so this is safe to run inside the
// tracing hot path.
// =============================================================================

use tracing::field::{Field, Visit};
use tracing::{Event as TracingEvent, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::bus::EventBus;
use crate::events::{EventKind, LogLevel};

pub struct BusLogLayer {
    bus: EventBus,
}

impl BusLogLayer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for BusLogLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        // Levels order by verbosity: ERROR < WARN < INFO.
        if level > Level::WARN {
            return;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let metadata = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(visitor.fields))
        };

        self.bus.publish(EventKind::SystemLog {
            level: if level == Level::ERROR {
                LogLevel::Error
            } else {
                LogLevel::Warn
            },
            source: event.metadata().target().to_string(),
            message: visitor.message,
            metadata,
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(format!("{value:?}")),
            );
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::json!(value));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicFilter;
    use crate::events::topics;
    use tracing_subscriber::prelude::*;

    #[tokio::test]
    async fn warn_records_become_system_log_events() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe(TopicFilter::Topics(vec![topics::SYSTEM_LOG]));

        let subscriber = tracing_subscriber::registry().with(BusLogLayer::new(bus));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(account_id = "a1", "gateway degraded");
            tracing::info!("routine noise stays off the bus");
        });

        let ev = sub.try_recv().expect("warn forwarded");
        match ev.kind {
            EventKind::SystemLog {
                level,
                message,
                metadata,
                ..
            } => {
                assert_eq!(level, LogLevel::Warn);
                assert_eq!(message, "gateway degraded");
                let metadata = metadata.unwrap();
                assert_eq!(metadata["account_id"], "a1");
            }
            _ => panic!("expected system log"),
        }
        assert!(sub.try_recv().is_none(), "info record must not cross");
    }
}
