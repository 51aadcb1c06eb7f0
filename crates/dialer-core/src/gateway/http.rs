//! ============================================================================
//! HTTP Voice Gateway - Call placement over REST
//! ============================================================================
//! Posts a JSON placement request with bearer authentication:
//! - destination and transfer target
//! - optional SIP trunk origination parameters
//! The gateway's call identifier is read with the tolerant response rules.
//! ============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{PlaceCallRequest, PlacedCall, VoiceGateway};
use crate::config::{GatewayConfig, SipTrunk};
use crate::extract;
use crate::types::{DialerError, DialerResult};

/// Executor for call placement against the voice gateway
pub struct HttpVoiceGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpVoiceGateway {
    pub fn new(config: GatewayConfig) -> DialerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DialerError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl VoiceGateway for HttpVoiceGateway {
    async fn place_call(&self, request: &PlaceCallRequest) -> DialerResult<PlacedCall> {
        let (endpoint, api_key, transfer_to) = self.config.require()?;

        info!("Placing call {} to {}", request.call_id, request.to);

        let body = PlaceCallBody::new(&request.to, transfer_to, self.config.sip_trunk.as_ref());

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| DialerError::Gateway(format!("Failed to reach voice gateway: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DialerError::Gateway(format!("Failed to read gateway response: {}", e)))?;

        if !status.is_success() {
            return Err(DialerError::Gateway(format!(
                "Voice gateway returned {}: {}",
                status,
                truncate(&text, 300)
            )));
        }

        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| DialerError::Gateway(format!("Failed to parse gateway response: {}", e)))?;

        let external_call_id = extract::response_call_id(&raw).ok_or_else(|| {
            DialerError::Gateway(format!(
                "Gateway response carried no call id: {}",
                truncate(&text, 300)
            ))
        })?;

        debug!("Call {} placed as {}", request.call_id, external_call_id);

        Ok(PlacedCall {
            external_call_id,
            raw,
        })
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Gateway API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct PlaceCallBody<'a> {
    to: &'a str,
    transfer_to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sip: Option<SipBody<'a>>,
}

#[derive(Debug, Serialize)]
struct SipBody<'a> {
    address: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

impl<'a> PlaceCallBody<'a> {
    fn new(to: &'a str, transfer_to: &'a str, trunk: Option<&'a SipTrunk>) -> Self {
        Self {
            to,
            transfer_to,
            sip: trunk.map(|t| SipBody {
                address: &t.address,
                port: t.port,
                username: t.username.as_deref(),
                password: t.password.as_deref(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn configured(endpoint: String) -> GatewayConfig {
        GatewayConfig {
            endpoint: Some(endpoint),
            api_key: Some("secret-key".into()),
            transfer_destination: Some("+5511888888888".into()),
            sip_trunk: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn request() -> PlaceCallRequest {
        PlaceCallRequest {
            call_id: "call-1".into(),
            to: "+5511999999999".into(),
        }
    }

    /// Serve one canned HTTP response and hand back the raw request
    async fn one_shot_server(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (format!("http://{}/v1/calls", addr), handle)
    }

    #[test]
    fn test_body_shape_with_sip_trunk() {
        let trunk = SipTrunk {
            address: "sip.example.net".into(),
            port: 5080,
            username: Some("trunk".into()),
            password: None,
        };
        let body = PlaceCallBody::new("+5511999999999", "+5511888888888", Some(&trunk));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "to": "+5511999999999",
                "transfer_to": "+5511888888888",
                "sip": {"address": "sip.example.net", "port": 5080, "username": "trunk"}
            })
        );

        let plain = PlaceCallBody::new("+5511999999999", "+5511888888888", None);
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            json!({"to": "+5511999999999", "transfer_to": "+5511888888888"})
        );
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let mut config = configured("http://127.0.0.1:9/v1/calls".into());
        config.api_key = None;
        let gateway = HttpVoiceGateway::new(config).unwrap();

        let err = gateway.place_call(&request()).await.unwrap_err();
        assert!(matches!(err, DialerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_place_call_extracts_nested_id() {
        let (url, server) = one_shot_server("200 OK", r#"{"data":{"call_id":"ext-42"}}"#).await;
        let gateway = HttpVoiceGateway::new(configured(url)).unwrap();

        let placed = gateway.place_call(&request()).await.unwrap();
        assert_eq!(placed.external_call_id, "ext-42");

        let raw_request = server.await.unwrap();
        assert!(raw_request.starts_with("POST /v1/calls"));
        assert!(raw_request.contains("Bearer secret-key"));
        assert!(raw_request.contains(r#""transfer_to":"+5511888888888""#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_gateway_error() {
        let (url, server) = one_shot_server("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let gateway = HttpVoiceGateway::new(configured(url)).unwrap();

        let err = gateway.place_call(&request()).await.unwrap_err();
        assert!(matches!(err, DialerError::Gateway(ref m) if m.contains("503") && m.contains("busy")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_without_id_is_gateway_error() {
        let (url, server) = one_shot_server("200 OK", r#"{"status":"queued"}"#).await;
        let gateway = HttpVoiceGateway::new(configured(url)).unwrap();

        let err = gateway.place_call(&request()).await.unwrap_err();
        assert!(matches!(err, DialerError::Gateway(ref m) if m.contains("no call id")));
        server.await.unwrap();
    }
}
