use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work that can be stored in the queue and run later by any worker.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendNewsletter { issue: u32 }
///
/// impl Payload for SendNewsletter {
///     const JOB_TYPE: &'static str = "send_newsletter";
///
///     fn display_name(&self) -> String {
///         format!("newsletter #{}", self.issue)
///     }
///
///     async fn perform(&self) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator written into the stored envelope.
    ///
    /// This MUST be unique across the payloads a worker registers.
    const JOB_TYPE: &'static str;

    /// Label used in logs.
    fn display_name(&self) -> String {
        Self::JOB_TYPE.to_string()
    }

    /// Run the job. An `Err` is recorded on the row and the job is retried.
    fn perform(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Stored form of a payload: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: Value,
}

impl Envelope {
    pub fn wrap<P: Payload>(payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_type: P::JOB_TYPE.to_string(),
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(handler: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(handler)
    }
}
