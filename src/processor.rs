//! Processor role: one frame in, one frame out.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Result, RuntimeError};
use crate::session::SessionRegistry;

pub struct ProcessorHandler {
    registry: Arc<SessionRegistry>,
}

impl ProcessorHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn create_session(&self, tenant_id: &str, config: Bytes) -> Result<String> {
        let session = self.registry.create(tenant_id, config).await?;
        Ok(session.id().to_string())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.registry.close(session_id).await
    }

    /// Decodes `frame`, runs the session's processor and encodes the result.
    /// Any failure fails this call only; the session stays usable.
    pub async fn process(&self, session_id: &str, frame: Bytes) -> Result<Bytes> {
        let session = self.registry.get(session_id)?;
        let input = codec::decode(frame)?;
        let records_in = input.len();

        let output = session
            .with_processor(move |processor| processor.process(input))
            .await?
            .map_err(|err| {
                warn!(session_id = %session_id, records = records_in, error = %err, "process failed");
                RuntimeError::User(err)
            })?;

        debug!(
            session_id = %session_id,
            records_in,
            records_out = output.len(),
            "batch processed"
        );
        Ok(codec::encode(&output)?)
    }
}
