use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinError;

use crate::job::Job;
use crate::payload::{Envelope, Payload};

/// Why a job did not complete
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{message}")]
    Execution { message: String, trace: Vec<String> },

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub(crate) fn from_anyhow(error: anyhow::Error) -> Self {
        Self::Execution {
            message: error.to_string(),
            trace: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Cause chain of an execution failure, outermost first.
    pub fn trace(&self) -> &[String] {
        match self {
            Self::Execution { trace, .. } => trace,
            _ => &[],
        }
    }
}

pub type JobResult = Result<(), JobError>;

type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

type NameResolver = fn(&Value) -> Option<String>;

#[derive(Clone)]
struct RegisteredHandler {
    handler: BoxedHandler,
    display_name: NameResolver,
}

fn resolve_name<P: Payload>(data: &Value) -> Option<String> {
    P::deserialize(data).ok().map(|payload| payload.display_name())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Maps stored type discriminators to the payload types that can run them
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a payload type; a later registration of the same
    /// `JOB_TYPE` replaces the earlier one.
    pub fn register<P: Payload>(&self) {
        let handler: BoxedHandler = Arc::new(
            |data: Value| -> Pin<Box<dyn Future<Output = JobResult> + Send>> {
                Box::pin(async move {
                    let payload: P = serde_json::from_value(data)?;
                    payload.perform().await.map_err(JobError::from_anyhow)
                })
            },
        );

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(
            P::JOB_TYPE.to_string(),
            RegisteredHandler {
                handler,
                display_name: resolve_name::<P>,
            },
        );
    }

    fn lookup(&self, job_type: &str) -> Option<RegisteredHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(job_type).cloned()
    }

    /// Run a job's payload to completion.
    ///
    /// The payload runs on its own task so a panic comes back as
    /// [`JobError::Panicked`].
    pub async fn execute(&self, job: &Job) -> JobResult {
        let envelope = Envelope::decode(&job.handler).map_err(JobError::MalformedPayload)?;
        let registered = self
            .lookup(&envelope.job_type)
            .ok_or_else(|| JobError::HandlerNotFound(envelope.job_type.clone()))?;

        let future = (registered.handler)(envelope.data);
        let handle = tokio::spawn(future);

        handle.await.map_err(|e: JoinError| {
            if e.is_panic() {
                JobError::Panicked(panic_message(&*e.into_panic()))
            } else {
                JobError::Panicked("job task was cancelled".to_string())
            }
        })?
    }

    /// Human-readable label for a job, falling back to its type label.
    pub fn display_name(&self, job: &Job) -> String {
        let Ok(envelope) = Envelope::decode(&job.handler) else {
            return "unknown".to_string();
        };

        self.lookup(&envelope.job_type)
            .and_then(|registered| (registered.display_name)(&envelope.data))
            .unwrap_or(envelope.job_type)
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use anyhow::Context;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Import {
        file: String,
    }

    impl Payload for Import {
        const JOB_TYPE: &'static str = "import";

        fn display_name(&self) -> String {
            format!("import {}", self.file)
        }

        async fn perform(&self) -> anyhow::Result<()> {
            if self.file == "panic.csv" {
                panic!("parser blew up");
            }
            if self.file == "missing.csv" {
                return Err(anyhow::anyhow!("no such file")).context("reading import");
            }
            Ok(())
        }
    }

    fn job_for(handler: String) -> Job {
        let now = Utc::now();
        Job {
            id: JobId(7),
            priority: 0,
            attempts: 0,
            handler,
            last_error: None,
            run_at: now,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn import_job(file: &str) -> Job {
        let envelope = Envelope::wrap(&Import { file: file.to_string() }).unwrap();
        job_for(envelope.encode().unwrap())
    }

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register::<Import>();
        registry
    }

    #[tokio::test]
    async fn executes_registered_payload() {
        assert!(registry().execute(&import_job("ok.csv")).await.is_ok());
    }

    #[tokio::test]
    async fn execution_error_keeps_cause_chain() {
        let err = registry().execute(&import_job("missing.csv")).await.unwrap_err();

        assert_eq!(err.message(), "reading import");
        assert_eq!(err.trace(), ["no such file".to_string()]);
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let err = registry().execute(&import_job("panic.csv")).await.unwrap_err();
        assert!(matches!(err, JobError::Panicked(ref msg) if msg == "parser blew up"));
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let job = job_for(r#"{"type":"eval","data":"1 + 1"}"#.to_string());
        let err = registry().execute(&job).await.unwrap_err();
        assert!(matches!(err, JobError::HandlerNotFound(ref t) if t == "eval"));
    }

    #[test]
    fn display_name_prefers_payload_label() {
        let registry = registry();

        assert_eq!(registry.display_name(&import_job("a.csv")), "import a.csv");
        assert_eq!(
            registry.display_name(&job_for(r#"{"type":"other","data":null}"#.to_string())),
            "other"
        );
        assert_eq!(registry.display_name(&job_for("not json".to_string())), "unknown");
    }
}
