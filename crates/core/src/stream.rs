//! Event stream references.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default service name for streams owned by the local engine instance.
pub const LOCAL_SERVICE: &str = "local";

/// Default stream name for aggregate write models.
pub const WRITE_MODEL_STREAM: &str = "write_model_stream";

/// Reference to a named event stream owned by a service.
///
/// Streams are referenced, never mutated after creation. The default
/// aggregate stream is [`Stream::of_write_model`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    service_name: String,
    stream_name: String,
}

impl Stream {
    pub fn new(
        service_name: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let service_name = service_name.into();
        let stream_name = stream_name.into();
        if service_name.is_empty() {
            return Err(CoreError::validation("stream service name must not be empty"));
        }
        if stream_name.is_empty() {
            return Err(CoreError::validation("stream name must not be empty"));
        }
        Ok(Self {
            service_name,
            stream_name,
        })
    }

    /// The default stream aggregate events are written to.
    pub fn of_write_model() -> Self {
        Self {
            service_name: LOCAL_SERVICE.to_string(),
            stream_name: WRITE_MODEL_STREAM.to_string(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

impl core::fmt::Display for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}::{}", self.service_name, self.stream_name)
    }
}
