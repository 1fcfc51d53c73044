// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reply transports and the scheme-routing composite used by the dispatcher.

pub mod http;
pub mod in_process;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::delivery::ReplyTransport;
use crate::domain::envelope::ReplyAddress;
use crate::domain::errors::DeliveryError;
use crate::domain::reply::ReplyPayload;

pub use http::HttpReplyTransport;
pub use in_process::{InProcessTransport, PendingReply, ReplyInbox};

/// Picks a transport by the reply address scheme.
#[derive(Default, Clone)]
pub struct CompositeTransport {
    routes: HashMap<String, Arc<dyn ReplyTransport>>,
}

impl CompositeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, scheme: impl Into<String>, transport: Arc<dyn ReplyTransport>) -> Self {
        self.routes.insert(scheme.into(), transport);
        self
    }

    /// `http`/`https` over HTTP, `local` in-process.
    pub fn standard(http: Arc<HttpReplyTransport>, local: Arc<InProcessTransport>) -> Self {
        Self::new()
            .route("http", http.clone())
            .route("https", http)
            .route(in_process::LOCAL_SCHEME, local)
    }
}

#[async_trait]
impl ReplyTransport for CompositeTransport {
    async fn deliver(&self, reply_to: &ReplyAddress, payload: &ReplyPayload) -> Result<(), DeliveryError> {
        let scheme = reply_to
            .scheme()
            .ok_or_else(|| DeliveryError::Permanent(format!("reply address has no scheme: {}", reply_to)))?;
        let transport = self
            .routes
            .get(scheme)
            .ok_or_else(|| DeliveryError::Permanent(format!("no transport for scheme {}", scheme)))?;
        transport.deliver(reply_to, payload).await
    }
}
