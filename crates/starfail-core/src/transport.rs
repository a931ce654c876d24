//! Transport abstraction for out-of-process provider calls (satellite modem
//! RPC, cellular system-bus queries, policy-engine route programming).
//!
//! Two implementations exist behind the same trait: a native in-process
//! client for hosts where the real wire protocol is reachable directly, and
//! a subprocess wrapper that shells out to the vendor CLI tool for hosts
//! where it isn't (embedded router images frequently ship the CLI but not a
//! usable client library). Capability is detected once at startup and the
//! choice is fixed for the life of the process — no per-call fallback, so a
//! provider that starts flaky stays on one code path instead of alternating.

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::StarfailError;

/// A single out-of-process request/response exchange with a provider.
///
/// `call` returns raw JSON rather than a generic type so the trait stays
/// object-safe (collectors hold a `Box<dyn Transport>` chosen once at
/// startup); callers decode the shape they expect with [`call_typed`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `method` with a JSON-encodable `params` payload. `timeout_ms`
    /// bounds the whole round trip.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, StarfailError>;
}

/// Convenience wrapper for callers that know the expected response shape.
pub async fn call_typed<R: DeserializeOwned>(
    transport: &dyn Transport,
    provider: &str,
    method: &str,
    params: serde_json::Value,
    timeout_ms: u64,
) -> Result<R, StarfailError> {
    let response = transport.call(method, params, timeout_ms).await?;
    serde_json::from_value(response).map_err(|e| StarfailError::ProviderTransient {
        provider: provider.to_string(),
        detail: format!("response shape mismatch: {e}"),
    })
}

/// Length-delimited JSON-over-TCP client for providers that expose a real
/// socket (e.g. a modem's local management port): a 4-byte big-endian length
/// prefix followed by the JSON payload, mirroring the framing style used
/// elsewhere in this codebase's transports.
pub struct NativeTransport {
    provider: String,
    addr: String,
}

impl NativeTransport {
    pub fn new(provider: impl Into<String>, addr: impl Into<String>) -> Self {
        NativeTransport {
            provider: provider.into(),
            addr: addr.into(),
        }
    }

    async fn exchange(
        &self,
        request: &serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, StarfailError> {
        let fut = async {
            let mut stream =
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|e| StarfailError::ProviderTransient {
                        provider: self.provider.clone(),
                        detail: format!("connect failed: {e}"),
                    })?;

            let body = serde_json::to_vec(request).map_err(|e| StarfailError::ProviderTransient {
                provider: self.provider.clone(),
                detail: format!("encode failed: {e}"),
            })?;
            let len = body.len() as u32;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| StarfailError::ProviderTransient {
                    provider: self.provider.clone(),
                    detail: format!("write failed: {e}"),
                })?;
            stream
                .write_all(&body)
                .await
                .map_err(|e| StarfailError::ProviderTransient {
                    provider: self.provider.clone(),
                    detail: format!("write failed: {e}"),
                })?;

            let mut len_buf = [0u8; 4];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| StarfailError::ProviderTransient {
                    provider: self.provider.clone(),
                    detail: format!("read failed: {e}"),
                })?;
            let resp_len = u32::from_be_bytes(len_buf) as usize;
            let mut resp_buf = vec![0u8; resp_len];
            stream
                .read_exact(&mut resp_buf)
                .await
                .map_err(|e| StarfailError::ProviderTransient {
                    provider: self.provider.clone(),
                    detail: format!("read failed: {e}"),
                })?;

            serde_json::from_slice(&resp_buf).map_err(|e| StarfailError::ProviderTransient {
                provider: self.provider.clone(),
                detail: format!("decode failed: {e}"),
            })
        };

        match timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(StarfailError::ProviderTransient {
                provider: self.provider.clone(),
                detail: format!("timed out after {timeout_ms}ms"),
            }),
        }
    }
}

#[async_trait::async_trait]
impl Transport for NativeTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, StarfailError> {
        let request = serde_json::json!({ "method": method, "params": params });
        self.exchange(&request, timeout_ms).await
    }
}

/// Wraps a vendor CLI tool, invoking it once per call and parsing its stdout
/// as JSON. Used on hosts where only the CLI binary is available.
pub struct SubprocessTransport {
    provider: String,
    binary: String,
    extra_args: Vec<String>,
}

impl SubprocessTransport {
    pub fn new(provider: impl Into<String>, binary: impl Into<String>) -> Self {
        SubprocessTransport {
            provider: provider.into(),
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Detect whether `binary` is available on `$PATH` (checked once at
    /// startup before falling back to this transport).
    pub async fn is_available(binary: &str) -> bool {
        Command::new("which")
            .arg(binary)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Transport for SubprocessTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value, StarfailError> {
        let params_json = serde_json::to_string(&params).map_err(|e| StarfailError::ProviderTransient {
            provider: self.provider.clone(),
            detail: format!("encode failed: {e}"),
        })?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.extra_args)
            .arg(method)
            .arg(&params_json)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let fut = async {
            let output = command
                .output()
                .await
                .map_err(|_| StarfailError::ProviderUnavailable {
                    provider: self.provider.clone(),
                })?;

            if !output.status.success() {
                return Err(StarfailError::ProviderTransient {
                    provider: self.provider.clone(),
                    detail: format!(
                        "exit {:?}: {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr)
                    ),
                });
            }

            serde_json::from_slice(&output.stdout).map_err(|e| StarfailError::ProviderTransient {
                provider: self.provider.clone(),
                detail: format!("decode failed: {e}"),
            })
        };

        match timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(StarfailError::ProviderTransient {
                provider: self.provider.clone(),
                detail: format!("timed out after {timeout_ms}ms"),
            }),
        }
    }
}

/// Picks the transport for `provider` once at startup: native if `native_addr`
/// is reachable-in-principle (a bare construction; collectors still handle
/// connect failures per call), otherwise the subprocess wrapper if `cli_binary`
/// is on `$PATH`, otherwise `None` (the caller degrades to reachability-only
/// collection).
pub async fn select_transport(
    provider: &str,
    native_addr: Option<&str>,
    cli_binary: Option<&str>,
) -> Option<Box<dyn Transport>> {
    if let Some(addr) = native_addr {
        return Some(Box::new(NativeTransport::new(provider, addr)));
    }
    if let Some(binary) = cli_binary {
        if SubprocessTransport::is_available(binary).await {
            return Some(Box::new(SubprocessTransport::new(provider, binary)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Transport selection ─────────────────────────────────────────────

    #[tokio::test]
    async fn selects_native_when_addr_given() {
        let transport = select_transport("satellite", Some("127.0.0.1:9999"), None).await;
        assert!(transport.is_some());
    }

    #[tokio::test]
    async fn selects_nothing_when_neither_available() {
        let transport =
            select_transport("cellular", None, Some("definitely-not-a-real-binary-xyz")).await;
        assert!(transport.is_none());
    }

    #[tokio::test]
    async fn subprocess_unavailable_binary_reports_false() {
        assert!(!SubprocessTransport::is_available("definitely-not-a-real-binary-xyz").await);
    }

    // ─── Native transport failure paths ─────────────────────────────────

    #[tokio::test]
    async fn native_transport_connect_failure_is_transient() {
        // Nothing listens on this port in the test environment.
        let transport = NativeTransport::new("satellite", "127.0.0.1:1");
        let result = transport.call("get_status", serde_json::json!({}), 200).await;
        assert!(matches!(result, Err(StarfailError::ProviderTransient { .. })));
    }
}
