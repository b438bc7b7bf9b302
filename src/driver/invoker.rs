use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::generator::InvocationSpec;
use crate::pb::faas::executor_client::ExecutorClient;
use crate::pb::faas::FaasRequest;

/// Successful executor reply, normalized across transports.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub message: String,
    pub duration_us: u64,
    pub memory_kb: u64,
}

/// Failure of a single invocation. Never aborts the driver; it lands on the
/// invocation record as a status plus error kind.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("server: {0}")]
    Server(String),
}

impl InvokeError {
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::Timeout(_) => "timeout",
            InvokeError::Transport(_) => "transport",
            InvokeError::Server(_) => "server",
        }
    }
}

/// The one seam between the driver and the cluster. Implementations are
/// opaque executors; tests substitute a mock.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &str,
        spec: &InvocationSpec,
        deadline: Duration,
    ) -> Result<InvocationOutput, InvokeError>;
}

/// gRPC transport (primary). Channels are established lazily and cached per
/// endpoint; the generated client is cheap to clone.
pub struct GrpcInvoker {
    clients: Mutex<HashMap<String, ExecutorClient<Channel>>>,
}

impl GrpcInvoker {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, endpoint: &str) -> Result<ExecutorClient<Channel>, InvokeError> {
        if let Some(client) = self.clients.lock().await.get(endpoint) {
            return Ok(client.clone());
        }

        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| InvokeError::Transport(format!("bad endpoint {endpoint}: {e}")))?
            .connect()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;
        let client = ExecutorClient::new(channel);
        self.clients
            .lock()
            .await
            .insert(endpoint.to_string(), client.clone());
        Ok(client)
    }
}

impl Default for GrpcInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FunctionInvoker for GrpcInvoker {
    async fn invoke(
        &self,
        endpoint: &str,
        spec: &InvocationSpec,
        deadline: Duration,
    ) -> Result<InvocationOutput, InvokeError> {
        let call = async {
            let mut client = self.client(endpoint).await?;
            let request = FaasRequest {
                message: String::new(),
                runtime_in_milli_sec: spec.runtime_ms,
                memory_in_mebi_bytes: spec.memory_mib,
                batchsize: spec.batchsize.unwrap_or(0).max(0) as u32,
                gpu_memory_in_mebi_bytes: 0,
                prompt_tensor: Vec::new(),
            };
            let reply = client
                .execute(tonic::Request::new(request))
                .await
                .map_err(|status| match status.code() {
                    tonic::Code::DeadlineExceeded => InvokeError::Timeout(deadline),
                    _ => InvokeError::Server(status.to_string()),
                })?
                .into_inner();
            Ok(InvocationOutput {
                message: reply.message,
                duration_us: reply.duration_in_micro_sec,
                memory_kb: reply.memory_usage_in_kb,
            })
        };

        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(deadline)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpFaasRequest {
    runtime_in_milli_sec: u32,
    memory_in_mebi_bytes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    batchsize: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpFaasReply {
    #[serde(default)]
    message: String,
    duration_in_micro_sec: u64,
    memory_usage_in_kb: u64,
}

/// HTTP JSON transport for deployments without gRPC ingress.
pub struct HttpInvoker {
    http: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(
        &self,
        endpoint: &str,
        spec: &InvocationSpec,
        deadline: Duration,
    ) -> Result<InvocationOutput, InvokeError> {
        let body = HttpFaasRequest {
            runtime_in_milli_sec: spec.runtime_ms,
            memory_in_mebi_bytes: spec.memory_mib,
            batchsize: spec.batchsize,
        };

        let response = self
            .http
            .post(endpoint)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout(deadline)
                } else {
                    InvokeError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(InvokeError::Server(format!(
                "status {}",
                response.status()
            )));
        }

        let reply: HttpFaasReply = response
            .json()
            .await
            .map_err(|e| InvokeError::Server(format!("bad reply body: {e}")))?;
        Ok(InvocationOutput {
            message: reply.message,
            duration_us: reply.duration_in_micro_sec,
            memory_kb: reply.memory_usage_in_kb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_record_labels() {
        assert_eq!(InvokeError::Timeout(Duration::from_secs(2)).kind(), "timeout");
        assert_eq!(InvokeError::Transport("refused".into()).kind(), "transport");
        assert_eq!(InvokeError::Server("500".into()).kind(), "server");
    }

    #[test]
    fn http_request_body_uses_wire_field_names() {
        let body = HttpFaasRequest {
            runtime_in_milli_sec: 250,
            memory_in_mebi_bytes: 128,
            batchsize: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["runtimeInMilliSec"], 250);
        assert_eq!(value["memoryInMebiBytes"], 128);
        assert!(value.get("batchsize").is_none());
    }

    #[test]
    fn http_reply_parses_wire_field_names() {
        let reply: HttpFaasReply = serde_json::from_str(
            r#"{"message":"OK - host","durationInMicroSec":1042,"memoryUsageInKb":131072}"#,
        )
        .unwrap();
        assert_eq!(reply.message, "OK - host");
        assert_eq!(reply.duration_in_micro_sec, 1042);
        assert_eq!(reply.memory_usage_in_kb, 131072);
    }
}
