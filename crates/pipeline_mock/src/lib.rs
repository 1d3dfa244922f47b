//! Demo plugins, one per role. Each reads its per-session settings from the
//! JSON config blob the host passes to `createSession`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pipeline_plugin::{Batch, Lifecycle, PluginError, Processor, Record, SessionContext, Sink, Source, UserData};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Records to emit before reporting end of input. 0 means never stop.
    pub count: u64,
    pub batch_size: u64,
    pub prefix: String,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self { count: 100, batch_size: 10, prefix: "record".to_string() }
    }
}

/// Emits numbered records, `batch_size` at a time.
#[derive(Default)]
pub struct CounterSource {
    config: CounterConfig,
    next: u64,
    tenant: String,
}

impl Lifecycle for CounterSource {
    fn init(&mut self, ctx: &SessionContext) -> Result<(), PluginError> {
        if !ctx.config().is_empty() {
            self.config = ctx.config_json()?;
        }
        if self.config.batch_size == 0 {
            return Err(PluginError::InvalidConfig("batch_size must be at least 1".into()));
        }
        self.tenant = ctx.tenant_id().to_string();
        info!(tenant_id = %self.tenant, count = self.config.count, "[mock] source ready");
        Ok(())
    }

    fn close(&mut self) -> Result<(), PluginError> {
        info!(tenant_id = %self.tenant, emitted = self.next, "[mock] source closed");
        Ok(())
    }
}

impl Source for CounterSource {
    fn read_batch(&mut self) -> Result<Option<Batch>, PluginError> {
        let remaining = match self.config.count {
            0 => u64::MAX,
            count => count.saturating_sub(self.next),
        };
        if remaining == 0 {
            return Ok(None);
        }

        let size = remaining.min(self.config.batch_size);
        let records = (self.next..self.next + size)
            .map(|n| Record::new(format!("{}-{n}", self.config.prefix)).with_metadata("seq", n.to_string()))
            .collect::<Batch>()
            .with_context("tenant", self.tenant.clone());
        self.next += size;
        Ok(Some(records))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Batches whose context has this key are rejected, to exercise negative acks.
    pub reject_key: Option<String>,
}

/// Logs every batch and keeps a record count in the session's user data.
#[derive(Default)]
pub struct LogSink {
    config: LogSinkConfig,
    written: Option<Arc<AtomicU64>>,
}

/// User-data key holding the sink's running record count.
pub const RECORDS_WRITTEN: &str = "records_written";

impl Lifecycle for LogSink {
    fn init(&mut self, ctx: &SessionContext) -> Result<(), PluginError> {
        if !ctx.config().is_empty() {
            self.config = ctx.config_json()?;
        }
        let data: Arc<UserData> = ctx.data();
        let counter = Arc::new(AtomicU64::new(0));
        data.insert(RECORDS_WRITTEN, counter.clone());
        self.written = Some(counter);
        Ok(())
    }
}

impl Sink for LogSink {
    fn write_batch(&mut self, batch: Batch) -> Result<(), PluginError> {
        if let Some(key) = &self.config.reject_key {
            if batch.context.contains_key(key) {
                return Err(PluginError::Other(format!("batch carries rejected key {key}")));
            }
        }
        let total = self
            .written
            .as_ref()
            .map(|c| c.fetch_add(batch.len() as u64, Ordering::Relaxed) + batch.len() as u64)
            .unwrap_or_default();
        info!(records = batch.len(), total, "[mock] sink wrote batch");
        Ok(())
    }
}

/// Upper-cases payloads and stamps each record with `processed_by`.
#[derive(Default)]
pub struct UppercaseProcessor {
    name: String,
}

impl Lifecycle for UppercaseProcessor {
    fn init(&mut self, ctx: &SessionContext) -> Result<(), PluginError> {
        self.name = format!("uppercase/{}", ctx.tenant_id());
        Ok(())
    }
}

impl Processor for UppercaseProcessor {
    fn process(&mut self, input: Batch) -> Result<Batch, PluginError> {
        let context = input.context;
        let records = input
            .records
            .into_iter()
            .map(|mut r| {
                r.metadata.insert("processed_by".to_string(), self.name.clone());
                Record { metadata: r.metadata, payload: r.payload.to_ascii_uppercase().into() }
            })
            .collect();
        Ok(Batch { records, context })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_emits_exact_count() {
        let mut source = CounterSource {
            config: CounterConfig { count: 25, batch_size: 10, prefix: "r".into() },
            ..Default::default()
        };
        let sizes: Vec<usize> = std::iter::from_fn(|| source.read_batch().unwrap()).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(source.read_batch().unwrap().is_none());
    }

    #[test]
    fn counter_config_fills_missing_fields() {
        let config: CounterConfig = serde_json::from_value(serde_json::json!({"count": 3})).unwrap();
        assert_eq!(config.count, 3);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.prefix, "record");
    }

    #[test]
    fn sink_rejects_marked_batches() {
        let mut sink = LogSink {
            config: LogSinkConfig { reject_key: Some("poison".into()) },
            ..Default::default()
        };
        assert!(sink.write_batch(Batch::default()).is_ok());
        assert!(sink.write_batch(Batch::default().with_context("poison", "1")).is_err());
    }

    #[test]
    fn processor_uppercases() {
        let mut p = UppercaseProcessor { name: "u".into() };
        let out = p.process(Batch::new(vec![Record::new("abc")])).unwrap();
        assert_eq!(out.records[0].payload.as_ref(), b"ABC");
        assert_eq!(out.records[0].metadata["processed_by"], "u");
    }
}
