use std::collections::HashMap;

use bytes::Bytes;

/// A single data record travelling through the pipeline.
///
/// The payload is opaque: the runtime never looks inside it. After decoding a
/// frame the payload is a slice of the frame buffer, not a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub metadata: HashMap<String, String>,
    pub payload: Bytes,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { metadata: HashMap::new(), payload: payload.into() }
    }

    /// Builder-style helper to attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An ordered group of records plus batch-scoped context (tenant ids, batch ids, ...).
///
/// Batches are the unit of flow control and acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<Record>,
    pub context: HashMap<String, String>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records, context: HashMap::new() }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// A batch without records. A source returning one means "nothing ready yet".
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<Record> for Batch {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Batch::new(iter.into_iter().collect())
    }
}
