// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rule-based degraded LLM.
//!
//! Answers deterministically when every hosted model is unreachable. Output
//! is always prefixed with [`DEGRADED_MARKER`] (or carries a `"degraded": true`
//! field for JSON requests) so downstream consumers can tell it apart from a
//! real completion.

use async_trait::async_trait;
use serde_json::json;

use crate::domain::capability::{Backend, Generation, GenerationOptions, LlmBackend};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

pub const DEGRADED_MARKER: &str = "[degraded]";
pub const RULE_BASED_MODEL: &str = "local/rule-based";

pub struct RuleBasedLlm {
    name: String,
}

impl RuleBasedLlm {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn first_sentences(text: &str, count: usize) -> String {
        let mut out = String::new();
        let mut taken = 0;
        for sentence in text.split_inclusive(['.', '!', '?']) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(sentence);
            taken += 1;
            if taken == count {
                break;
            }
        }
        out
    }

    fn truncate_words(text: &str, max_words: Option<u32>) -> String {
        match max_words {
            Some(max) => text.split_whitespace().take(max as usize).collect::<Vec<_>>().join(" "),
            None => text.to_string(),
        }
    }

    fn respond(prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        let body = prompt
            .split_once(':')
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty())
            .unwrap_or(prompt);

        if lower.contains("json") {
            return json!({
                "degraded": true,
                "message": "language model unavailable; rule-based response",
                "input_words": prompt.split_whitespace().count(),
            })
            .to_string();
        }

        if lower.starts_with("summarize") || lower.starts_with("summarise") || lower.contains("summary") {
            return format!("{} Summary: {}", DEGRADED_MARKER, Self::first_sentences(body, 2));
        }

        if lower.starts_with("classify") {
            let label = if ["error", "fail", "down", "outage"].iter().any(|w| lower.contains(w)) {
                "incident"
            } else {
                "general"
            };
            return format!("{} Classification: {}", DEGRADED_MARKER, label);
        }

        format!(
            "{} The language model is temporarily unavailable. Your request was received and can be retried later.",
            DEGRADED_MARKER
        )
    }
}

impl Default for RuleBasedLlm {
    fn default() -> Self {
        Self::new("local-rule-llm")
    }
}

#[async_trait]
impl Backend for RuleBasedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl LlmBackend for RuleBasedLlm {
    async fn generate(
        &self,
        _tenant: &TenantId,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, BackendError> {
        if prompt.trim().is_empty() {
            return Err(BackendError::InvalidRequest("prompt cannot be empty".to_string()));
        }
        let text = Self::respond(prompt);
        let text = if text.starts_with('{') {
            text
        } else {
            Self::truncate_words(&text, options.max_tokens)
        };
        Ok(Generation {
            text,
            model: RULE_BASED_MODEL.to_string(),
        })
    }
}
