//! Language model capability.
//!
//! The pipeline is rule-first; a model is only consulted when the rules find
//! no subject, when a reference cannot be resolved, or to answer general
//! questions. [`ModelGateway`] wraps any [`LanguageModel`] with a timeout,
//! one retry on transient failures, and a confidence floor.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use askdb_core::config::LimitsConfig;
use askdb_core::types::QueryClass;

use crate::error::ModelError;

/// A model reply with the model's own confidence in it (0.0 to 1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub confidence: f64,
}

impl Completion {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Text completion service.
pub trait LanguageModel: Send + Sync {
    /// Complete `prompt`; `context` carries recent conversation turns.
    fn complete(
        &self,
        prompt: &str,
        context: &str,
    ) -> impl Future<Output = Result<Completion, ModelError>> + Send;
}

/// Object-safe version of [`LanguageModel`] for dynamic dispatch.
pub trait DynLanguageModel: Send + Sync {
    fn complete_boxed<'a>(
        &'a self,
        prompt: &'a str,
        context: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Completion, ModelError>> + Send + 'a>>;
}

impl<T: LanguageModel> DynLanguageModel for T {
    fn complete_boxed<'a>(
        &'a self,
        prompt: &'a str,
        context: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Completion, ModelError>> + Send + 'a>> {
        Box::pin(self.complete(prompt, context))
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Timeout, retry and confidence policy around a model.
#[derive(Clone)]
pub struct ModelGateway {
    model: Arc<dyn DynLanguageModel>,
    timeout: Duration,
    min_confidence: f64,
}

impl std::fmt::Debug for ModelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGateway")
            .field("timeout", &self.timeout)
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

impl ModelGateway {
    pub fn new(model: Arc<dyn DynLanguageModel>, limits: &LimitsConfig) -> Self {
        Self {
            model,
            timeout: Duration::from_secs(limits.model_timeout_secs),
            min_confidence: limits.model_min_confidence,
        }
    }

    /// Call the model, retrying once on a transient failure. Replies below
    /// the confidence floor are reported as [`ModelError::LowConfidence`].
    pub async fn complete(&self, prompt: &str, context: &str) -> Result<Completion, ModelError> {
        let completion = match self.attempt(prompt, context).await {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Transient model failure, retrying once");
                self.attempt(prompt, context).await?
            }
            other => other?,
        };

        if completion.confidence < self.min_confidence {
            debug!(
                confidence = completion.confidence,
                threshold = self.min_confidence,
                "Model reply below confidence floor"
            );
            return Err(ModelError::LowConfidence {
                confidence: completion.confidence,
                threshold: self.min_confidence,
            });
        }
        Ok(completion)
    }

    /// Ask the model which class an ambiguous utterance belongs to. `None`
    /// when the model fails or replies with something unrecognizable.
    pub async fn classify(&self, utterance: &str, context: &str) -> Option<QueryClass> {
        match self.complete(&classify_prompt(utterance, context), context).await {
            Ok(completion) => parse_class(&completion.text),
            Err(e) => {
                debug!(error = %e, "Model classification unavailable");
                None
            }
        }
    }

    /// Answer a general question using recent conversation context.
    pub async fn answer(&self, question: &str, context: &str) -> Result<String, ModelError> {
        let prompt = general_prompt(question, context);
        Ok(self.complete(&prompt, context).await?.text.trim().to_string())
    }

    async fn attempt(&self, prompt: &str, context: &str) -> Result<Completion, ModelError> {
        match tokio::time::timeout(self.timeout, self.model.complete_boxed(prompt, context)).await
        {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.timeout.as_secs())),
        }
    }
}

pub fn classify_prompt(utterance: &str, context: &str) -> String {
    format!(
        "Classify the user's message for a database assistant. Reply with exactly one \
         word: data (asks for rows or numbers from the data), schema (asks about tables or \
         columns), followup (refines the previous request), or general (anything else).\n\n\
         Conversation:\n{context}\n\n\
         Message: {utterance}\n\n\
         Class:"
    )
}

/// First recognizable class word in a reply.
pub fn parse_class(reply: &str) -> Option<QueryClass> {
    reply
        .split(|c: char| !c.is_ascii_alphabetic() && c != '_' && c != '-')
        .map(|w| w.to_ascii_lowercase().replace('-', "_"))
        .find_map(|w| w.parse().ok())
}

/// Prompt for questions that are neither data nor schema requests.
pub fn general_prompt(question: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "(none)"
    } else {
        context
    };
    format!(
        "You are a helpful data analysis assistant. The user has asked a question about \
         data analysis or databases.\n\
         Use the conversation context to provide a more relevant and helpful response.\n\n\
         Conversation Context:\n{context}\n\n\
         User Question: {question}\n\n\
         Response:\n"
    )
}

/// Prompt asking the model to restate a follow-up as a standalone request.
pub fn rewrite_prompt(utterance: &str, context: &str) -> String {
    format!(
        "Rewrite the user's latest message as a complete, standalone data request, using \
         the conversation so far. Reply with the rewritten request only.\n\n\
         Conversation:\n{context}\n\n\
         Latest message: {utterance}\n\n\
         Rewritten request:\n"
    )
}

// =============================================================================
// SQL extraction
// =============================================================================

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:sql)?\s*(.*?)```").expect("Invalid fenced block regex")
});

/// Pull a SQL statement out of a free-form model reply: a fenced code block
/// first, then the lines starting at the first `SELECT` line, then whatever
/// follows the first `SELECT` anywhere in the text.
pub fn extract_sql(reply: &str) -> Option<String> {
    let reply = reply.trim();

    if let Some(caps) = FENCED.captures(reply) {
        let body = caps[1].trim();
        if !body.is_empty() {
            return Some(clean(body));
        }
    }

    let mut lines = Vec::new();
    for line in reply.lines().map(str::trim) {
        if lines.is_empty() && !starts_with_select(line) {
            continue;
        }
        if line.is_empty() {
            break;
        }
        if let Some(end) = line.find(';') {
            lines.push(&line[..end]);
            break;
        }
        lines.push(line);
    }
    if !lines.is_empty() {
        return Some(clean(&lines.join("\n")));
    }

    let upper = reply.to_ascii_uppercase();
    let start = upper.find("SELECT")?;
    let tail = &reply[start..];
    let end = [";", "\n\n", "```"]
        .iter()
        .filter_map(|marker| tail.find(marker))
        .min()
        .unwrap_or(tail.len());
    let sql = clean(&tail[..end]);
    (!sql.is_empty()).then_some(sql)
}

fn starts_with_select(line: &str) -> bool {
    line.get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
}

fn clean(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_string()
}

// =============================================================================
// Mock
// =============================================================================

/// Scripted model for tests. Replies are consumed in order; once the script
/// is exhausted the fallback reply is returned.
#[derive(Debug)]
pub struct MockLanguageModel {
    script: Mutex<VecDeque<Result<Completion, ModelError>>>,
    fallback: Completion,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Completion::new("I can help you explore your database.", 0.9),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply.
    pub fn with_reply(self, text: &str, confidence: f64) -> Self {
        self.push(Ok(Completion::new(text, confidence)));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, error: ModelError) -> Self {
        self.push(Err(error));
        self
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn push(&self, reply: Result<Completion, ModelError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageModel for MockLanguageModel {
    async fn complete(&self, prompt: &str, _context: &str) -> Result<Completion, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
