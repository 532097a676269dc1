//! Datagen source connector
//!
//! Generates synthetic change events without any external system. Useful for
//! demos, soak tests and for exercising idle alerting: the optional silence
//! window makes the source go quiet periodically.
//!
//! # Configuration
//!
//! ```yaml
//! source:
//!   connector: datagen
//!   swimlane: "0"
//!   empty_fetch_threshold: 60
//!   empty_fetch_notice_span: 300
//!   config:
//!     table: shop.orders
//!     pattern: orders
//!     events_per_second: 50
//!     batch_size: 10
//!     emit_secs: 30       # produce for 30s...
//!     silence_secs: 120   # ...then stay silent for 120s
//!     max_events: 0       # unlimited
//!     on_exhausted: idle  # or "stop" to raise a stop trigger
//! ```

use super::{parse_config, SourceConnector};
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventBatch, EventOp, Position};
use crate::idle::IdleSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tidesync_common::{SwimlaneId, TaskConfig};
use tracing::{debug, info};

/// Datagen source configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatagenConfig {
    /// Table name stamped on every event
    #[serde(default = "default_table")]
    pub table: String,

    /// Shape of the generated rows
    #[serde(default)]
    pub pattern: DataPattern,

    /// Events per second (0 = as fast as possible)
    #[serde(default = "default_events_per_second")]
    pub events_per_second: u32,

    /// Events per fetched batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum events to generate (0 = unlimited)
    #[serde(default)]
    pub max_events: u64,

    /// Seconds of output before each silence window (0 = no silence)
    #[serde(default)]
    pub emit_secs: u64,

    /// Seconds of silence after each emit window
    #[serde(default)]
    pub silence_secs: u64,

    /// Behavior once `max_events` is reached
    #[serde(default)]
    pub on_exhausted: ExhaustedBehavior,

    /// Seed for reproducible output
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_table() -> String {
    "datagen.orders".to_string()
}

fn default_events_per_second() -> u32 {
    10
}

fn default_batch_size() -> usize {
    10
}

impl Default for DatagenConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            pattern: DataPattern::default(),
            events_per_second: default_events_per_second(),
            batch_size: default_batch_size(),
            max_events: 0,
            emit_secs: 0,
            silence_secs: 0,
            on_exhausted: ExhaustedBehavior::default(),
            seed: None,
        }
    }
}

/// Row shapes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPattern {
    /// `{"id": n}`
    Sequence,
    /// Order rows
    #[default]
    Orders,
    /// User rows
    Users,
}

/// What the source does after its last event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedBehavior {
    /// Keep returning empty fetches
    #[default]
    Idle,
    /// Raise a stop trigger
    Stop,
}

/// xorshift64, reproducible with a seed
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x853c49e6748fea9b } else { seed },
        }
    }

    fn from_time() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::new(seed)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + self.next_u64() % (max - min)
    }

    fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.range(0, items.len() as u64) as usize]
    }
}

/// Synthetic source
pub struct DatagenSource {
    config: DatagenConfig,
    swimlane: SwimlaneId,
    idle: IdleSettings,
    rng: Rng,
    sequence: u64,
    started: Option<Instant>,
    next_emit: Option<Instant>,
}

impl DatagenSource {
    pub fn new(config: DatagenConfig, swimlane: SwimlaneId, idle: IdleSettings) -> Self {
        let rng = config.seed.map(Rng::new).unwrap_or_else(Rng::from_time);
        Self {
            config,
            swimlane,
            idle,
            rng,
            sequence: 0,
            started: None,
            next_emit: None,
        }
    }

    /// Build from the task snapshot's source section
    pub fn from_task(task: &TaskConfig) -> ConnectorResult<Self> {
        let config: DatagenConfig = parse_config(&task.source.config)?;
        if config.batch_size == 0 {
            return Err(ConnectorError::config("datagen batch_size must be at least 1"));
        }
        if config.table.trim().is_empty() {
            return Err(ConnectorError::config("datagen table must not be empty"));
        }
        Ok(Self::new(
            config,
            task.source.swimlane.clone(),
            IdleSettings::from(&task.source),
        ))
    }

    /// Events generated so far
    pub fn generated(&self) -> u64 {
        self.sequence
    }

    fn exhausted(&self) -> bool {
        self.config.max_events > 0 && self.sequence >= self.config.max_events
    }

    fn in_silence(&self, elapsed: Duration) -> bool {
        let emit = self.config.emit_secs;
        let silence = self.config.silence_secs;
        if emit == 0 || silence == 0 {
            return false;
        }
        elapsed.as_secs() % (emit + silence) >= emit
    }

    fn next_event(&mut self) -> Event {
        self.sequence += 1;
        let seq = self.sequence;
        let op = match self.rng.range(0, 20) {
            0 => EventOp::Delete,
            1..=5 => EventOp::Update,
            _ => EventOp::Insert,
        };
        let payload = match self.config.pattern {
            DataPattern::Sequence => serde_json::json!({ "id": seq }),
            DataPattern::Orders => self.order(seq),
            DataPattern::Users => self.user(seq),
        };
        Event::new(
            self.config.table.as_str(),
            op,
            Position::new(format!("datagen:{}", seq)),
            payload,
        )
    }

    fn order(&mut self, seq: u64) -> serde_json::Value {
        const PRODUCTS: &[&str] = &["Widget Pro", "Gadget X", "Super Tool", "Smart Hub", "Data Box"];
        const STATUSES: &[&str] = &["pending", "confirmed", "shipped", "delivered", "cancelled"];

        let quantity = self.rng.range(1, 10);
        let unit_cents = self.rng.range(500, 20_000);
        serde_json::json!({
            "order_id": format!("ORD-{:08}", seq),
            "customer_id": format!("user_{:08}", self.rng.range(1, 10_000)),
            "product": self.rng.choose(PRODUCTS),
            "quantity": quantity,
            "total_cents": quantity * unit_cents,
            "status": self.rng.choose(STATUSES),
        })
    }

    fn user(&mut self, seq: u64) -> serde_json::Value {
        const COUNTRIES: &[&str] = &["US", "DE", "FR", "JP", "BR", "IN"];

        serde_json::json!({
            "user_id": seq,
            "username": format!("user_{:08}", seq),
            "age": self.rng.range(18, 80),
            "country": self.rng.choose(COUNTRIES),
        })
    }
}

#[async_trait]
impl SourceConnector for DatagenSource {
    async fn startup(&mut self) -> ConnectorResult<()> {
        let now = Instant::now();
        self.started = Some(now);
        self.next_emit = Some(now);
        info!(
            table = %self.config.table,
            swimlane = %self.swimlane,
            events_per_second = self.config.events_per_second,
            "Datagen source started"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> ConnectorResult<()> {
        info!(table = %self.config.table, generated = self.sequence, "Datagen source stopped");
        Ok(())
    }

    async fn fetch(&mut self) -> ConnectorResult<Option<EventBatch>> {
        let Some(started) = self.started else {
            return Err(ConnectorError::transient("datagen source not started"));
        };

        if self.exhausted() {
            return match self.config.on_exhausted {
                ExhaustedBehavior::Idle => Ok(None),
                ExhaustedBehavior::Stop => Err(ConnectorError::stop_trigger(format!(
                    "datagen exhausted after {} events",
                    self.sequence
                ))),
            };
        }

        let now = Instant::now();
        if self.in_silence(now.duration_since(started)) {
            return Ok(None);
        }
        if let Some(next) = self.next_emit {
            if now < next {
                return Ok(None);
            }
        }

        let mut count = self.config.batch_size;
        if self.config.max_events > 0 {
            count = count.min((self.config.max_events - self.sequence) as usize);
        }
        let batch: EventBatch = (0..count).map(|_| self.next_event()).collect();

        if self.config.events_per_second > 0 {
            let pause = Duration::from_secs_f64(count as f64 / self.config.events_per_second as f64);
            self.next_emit = Some(now + pause);
        }
        debug!(table = %self.config.table, events = batch.len(), "Datagen batch generated");
        Ok(Some(batch))
    }

    fn swimlane_id(&self) -> SwimlaneId {
        self.swimlane.clone()
    }

    fn client_info(&self) -> String {
        format!("datagen://{}", self.config.table)
    }

    fn idle_settings(&self) -> IdleSettings {
        self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(config: DatagenConfig) -> DatagenSource {
        DatagenSource::new(config, SwimlaneId::new("0"), IdleSettings::disabled())
    }

    #[tokio::test]
    async fn test_generates_batches() {
        let mut source = source(DatagenConfig {
            events_per_second: 0,
            batch_size: 5,
            seed: Some(42),
            ..Default::default()
        });
        source.startup().await.unwrap();

        let batch = source.fetch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.events()[0].table(), "datagen.orders");
        assert_eq!(batch.last_position(), Some(&Position::new("datagen:5")));
        assert!(batch.events()[0].payload().get("order_id").is_some());
    }

    #[tokio::test]
    async fn test_fetch_before_startup_is_retryable() {
        let mut source = source(DatagenConfig::default());
        let err = source.fetch().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_max_events_idle() {
        let mut source = source(DatagenConfig {
            events_per_second: 0,
            batch_size: 4,
            max_events: 6,
            pattern: DataPattern::Sequence,
            ..Default::default()
        });
        source.startup().await.unwrap();

        assert_eq!(source.fetch().await.unwrap().unwrap().len(), 4);
        assert_eq!(source.fetch().await.unwrap().unwrap().len(), 2);
        assert!(source.fetch().await.unwrap().is_none());
        assert_eq!(source.generated(), 6);
    }

    #[tokio::test]
    async fn test_max_events_stop_trigger() {
        let mut source = source(DatagenConfig {
            events_per_second: 0,
            max_events: 1,
            on_exhausted: ExhaustedBehavior::Stop,
            ..Default::default()
        });
        source.startup().await.unwrap();

        assert!(source.fetch().await.unwrap().is_some());
        assert!(source.fetch().await.unwrap_err().is_stop_trigger());
    }

    #[test]
    fn test_silence_window() {
        let source = source(DatagenConfig {
            emit_secs: 10,
            silence_secs: 20,
            ..Default::default()
        });
        assert!(!source.in_silence(Duration::from_secs(5)));
        assert!(source.in_silence(Duration::from_secs(10)));
        assert!(source.in_silence(Duration::from_secs(29)));
        assert!(!source.in_silence(Duration::from_secs(31)));
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_batches() {
        let mut source = source(DatagenConfig {
            events_per_second: 1,
            batch_size: 10,
            ..Default::default()
        });
        source.startup().await.unwrap();

        assert!(source.fetch().await.unwrap().is_some());
        assert!(source.fetch().await.unwrap().is_none(), "next batch is 10s away");
    }

    #[test]
    fn test_from_task_rejects_zero_batch() {
        let mut task = TaskConfig {
            task_id: "orders".into(),
            source: tidesync_common::SourceSpec::new("datagen"),
            target: tidesync_common::TargetSpec::new("memory"),
            mappings: Vec::new(),
            unmapped_tables: Default::default(),
            nodes: Vec::new(),
            alert_receivers: Vec::new(),
            pipeline: None,
        };
        task.source.config = serde_json::json!({"batch_size": 0});
        assert!(DatagenSource::from_task(&task).is_err());
    }
}
