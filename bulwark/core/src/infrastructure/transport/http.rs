// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Reply Transport
//!
//! POSTs the reply payload as JSON to `http(s)://` reply addresses. The
//! envelope id travels in the `Idempotency-Key` header so a receiver can drop
//! redeliveries. 5xx, 408, 429 and network errors are transient; every other
//! non-2xx status is permanent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::domain::delivery::ReplyTransport;
use crate::domain::envelope::ReplyAddress;
use crate::domain::errors::DeliveryError;
use crate::domain::reply::ReplyPayload;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";
pub const CONVERSATION_ID_HEADER: &str = "X-Conversation-Id";

pub struct HttpReplyTransport {
    client: reqwest::Client,
}

impl HttpReplyTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn classify(status: StatusCode) -> Result<(), DeliveryError> {
        if status.is_success() {
            Ok(())
        } else if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(DeliveryError::Transient(format!("HTTP {}", status)))
        } else {
            Err(DeliveryError::Permanent(format!("HTTP {}", status)))
        }
    }
}

#[async_trait]
impl ReplyTransport for HttpReplyTransport {
    async fn deliver(&self, reply_to: &ReplyAddress, payload: &ReplyPayload) -> Result<(), DeliveryError> {
        match reply_to.scheme() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(DeliveryError::Permanent(format!(
                    "unsupported reply address for HTTP transport: {}",
                    reply_to
                )))
            }
        }

        let response = self
            .client
            .post(reply_to.as_str())
            .header(IDEMPOTENCY_KEY_HEADER, payload.envelope_id.to_string())
            .header(TRACE_ID_HEADER, payload.trace_id.as_str())
            .header(CONVERSATION_ID_HEADER, payload.conversation_id.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request to {} failed: {}", reply_to, e)))?;

        let status = response.status();
        debug!(reply_to = %reply_to, status = %status, envelope_id = %payload.envelope_id, "reply POST completed");
        Self::classify(status)
    }
}
