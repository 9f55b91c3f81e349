//! Context-aware query processor: central coordinator for one database.
//!
//! Per request: validate, load the session, fetch the (cached) schema, build
//! the context window, resolve references, classify, generate SQL, execute it
//! under a timeout, pick a chart hint, and append the turn. Requests for the
//! same session are serialized; different sessions run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use askdb_core::config::{AskConfig, LimitsConfig};
use askdb_core::safety::redact_connection_details;
use askdb_core::types::{
    QueryClass, SchemaDescriptor, Session, SessionId, SessionSummary, TabularResult, Turn,
    TurnFailure,
};
use askdb_storage::SessionStore;

use crate::chart::{chart_hint, ChartPayload};
use crate::classifier::QueryClassifier;
use crate::connector::DynDatabaseConnector;
use crate::context::{ContextManager, ContextWindow};
use crate::dialect::Dialect;
use crate::error::{ConnectorError, QueryError};
use crate::generator::SqlGenerator;
use crate::model::{rewrite_prompt, ModelGateway};
use crate::resolver::ReferenceResolver;
use crate::text::IdentifierMatcher;

/// Reply to general questions when no language model is configured.
pub const HELP_TEXT: &str = "I answer questions about the connected database. \
Try \"what tables are there?\", \"show me all customers\", or \"total sales by region\". \
You can refine the last answer with follow-ups like \"what about 2020?\".";

/// Everything produced for one utterance.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub turn: Turn,
    pub result: Option<TabularResult>,
    pub chart: Option<ChartPayload>,
    /// Text reply to a general question.
    pub answer: Option<String>,
    pub warnings: Vec<String>,
    /// False when the turn could not be written to the session store.
    pub persisted: bool,
}

pub struct ContextAwareQueryProcessor {
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn DynDatabaseConnector>,
    model: Option<ModelGateway>,
    context: ContextManager,
    classifier: QueryClassifier,
    generator: SqlGenerator,
    limits: LimitsConfig,
    schema: RwLock<Option<Arc<SchemaDescriptor>>>,
    session_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContextAwareQueryProcessor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn DynDatabaseConnector>,
        config: &AskConfig,
    ) -> Self {
        let dialect = Dialect::for_family(&connector.descriptor().family);
        if let Some(warning) = dialect.compatibility_warning() {
            warn!("{}", warning);
        }
        Self {
            store,
            connector,
            model: None,
            context: ContextManager::new(config.context.clone()),
            classifier: QueryClassifier::new(IdentifierMatcher::new(
                config.generator.similarity_threshold,
            )),
            generator: SqlGenerator::new(dialect, config.generator.clone()),
            limits: config.limits.clone(),
            schema: RwLock::new(None),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a language model for fallback generation and general answers.
    pub fn with_model(mut self, model: ModelGateway) -> Self {
        self.model = Some(model);
        self
    }

    pub fn dialect(&self) -> &Dialect {
        self.generator.dialect()
    }

    // ---- Sessions ----

    pub fn new_session(&self) -> Result<SessionId, QueryError> {
        let session_id = SessionId::new();
        self.store
            .create_session(session_id, self.connector.descriptor())?;
        Ok(session_id)
    }

    /// Turns of a session in order, failed ones included.
    pub fn history(&self, session_id: SessionId) -> Result<Vec<Turn>, QueryError> {
        Ok(self
            .store
            .get_session(session_id)?
            .map(|s| s.turns)
            .unwrap_or_default())
    }

    pub fn clear_session(&self, session_id: SessionId) -> Result<bool, QueryError> {
        let existed = self.store.clear(session_id)?;
        if let Ok(mut locks) = self.session_locks.lock() {
            locks.remove(&session_id);
        }
        Ok(existed)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, QueryError> {
        Ok(self.store.list_sessions()?)
    }

    /// Delete sessions idle for more than `retention_days`.
    pub fn purge_inactive(&self, retention_days: u32) -> Result<usize, QueryError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let purged = self.store.purge_inactive(cutoff)?;
        if purged > 0 {
            info!(purged, retention_days, "Purged inactive sessions");
        }
        self.prune_idle_locks();
        Ok(purged)
    }

    /// Drop per-session locks no request is holding.
    fn prune_idle_locks(&self) {
        if let Ok(mut locks) = self.session_locks.lock() {
            let before = locks.len();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            debug!(pruned = before - locks.len(), "Pruned idle session locks");
        }
    }

    /// One-line description of the latest turn, e.g.
    /// `Last Query: 'show sales' | Type: data | SQL: SELECT * FROM sales | Result: 12 rows`.
    pub fn last_interaction_summary(
        &self,
        session_id: SessionId,
    ) -> Result<Option<String>, QueryError> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(None);
        };
        Ok(session.last_turn().map(summarize_turn))
    }

    // ---- Schema ----

    /// Schema of the connected database, fetched once and cached.
    pub async fn schema(&self) -> Result<Arc<SchemaDescriptor>, QueryError> {
        if let Some(schema) = self.schema.read().await.as_ref() {
            return Ok(Arc::clone(schema));
        }
        let mut slot = self.schema.write().await;
        if let Some(schema) = slot.as_ref() {
            return Ok(Arc::clone(schema));
        }
        let secs = self.limits.query_timeout_secs;
        let schema = match tokio::time::timeout(
            Duration::from_secs(secs),
            self.connector.get_schema_boxed(),
        )
        .await
        {
            Ok(result) => Arc::new(result.map_err(connector_error)?),
            Err(_) => {
                warn!(timeout_secs = secs, "Schema introspection timed out");
                return Err(QueryError::Timeout(secs));
            }
        };
        info!(tables = schema.tables.len(), "Schema loaded");
        *slot = Some(Arc::clone(&schema));
        Ok(schema)
    }

    /// Drop the cached schema so the next request reads it again.
    pub async fn refresh_schema(&self) {
        *self.schema.write().await = None;
    }

    pub async fn test_connection(&self) -> Result<(), QueryError> {
        self.connector
            .test_connection_boxed()
            .await
            .map_err(connector_error)
    }

    // ---- Processing ----

    /// Answer `utterance` within `session_id`, creating the session if needed.
    ///
    /// Input validation errors are returned without touching the session.
    /// Every other failure is recorded as a failed turn before it is returned;
    /// when that write fails too the error comes back as
    /// [`QueryError::Unrecorded`].
    pub async fn process(
        &self,
        session_id: SessionId,
        utterance: &str,
    ) -> Result<QueryOutcome, QueryError> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Err(QueryError::EmptyUtterance);
        }
        if utterance.chars().count() > self.limits.max_utterance_length {
            return Err(QueryError::UtteranceTooLong(self.limits.max_utterance_length));
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let started = Instant::now();

        let session = self.load_or_create(session_id)?;
        let mut turn = Turn::new(session_id, utterance);

        let schema = match self.schema().await {
            Ok(schema) => schema,
            Err(e) => return Err(self.record_failure(turn, e)),
        };

        let window = self.context.build_window(&session, utterance, Some(&schema));
        let mut warnings = Vec::new();
        let (resolved, used_references) = self
            .resolve(utterance, &window, &schema, &mut warnings)
            .await;
        turn.resolved_utterance = resolved.clone();

        let mut classification =
            self.classifier
                .classify(&resolved, used_references, &window, &schema);
        if classification.ambiguous {
            if let Some(model) = &self.model {
                if let Some(class) = model.classify(&resolved, &window.transcript()).await {
                    classification.class = class;
                }
            }
        }
        turn.classification = classification.class;
        debug!(
            session_id = %session_id,
            classification = %classification.class,
            ambiguous = classification.ambiguous,
            resolved = %resolved,
            "Utterance classified"
        );

        if classification.class == QueryClass::General {
            let answer = self.answer_general(&resolved, &window, &mut warnings).await;
            return Ok(self.finish(turn, None, None, Some(answer), warnings, started));
        }

        let generated = match self
            .generator
            .generate(
                &resolved,
                &classification,
                &window,
                &schema,
                self.model.as_ref(),
            )
            .await
        {
            Ok(generated) => generated,
            Err(e) => return Err(self.record_failure(turn, e)),
        };
        if generated.demoted {
            turn.classification = QueryClass::Data;
        }
        turn.generated_sql = Some(generated.sql.clone());
        turn.query_spec = generated.spec.clone();
        warnings.extend(generated.warnings);

        let result = match self.execute(&generated.sql).await {
            Ok(result) => result,
            Err(e) => return Err(self.record_failure(turn, e)),
        };

        let requested = generated.spec.as_ref().and_then(|s| s.chart_request);
        let chart = if generated.spec.as_ref().map(|s| s.is_rows()).unwrap_or(true) {
            chart_hint(&result, requested)
        } else {
            ChartPayload::table()
        };
        turn.result_summary = Some(result.summary());
        turn.chart_hint = Some(chart.hint);

        Ok(self.finish(turn, Some(result), Some(chart), None, warnings, started))
    }

    fn session_lock(&self, session_id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        match self.session_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(session_id).or_default()),
            // A poisoned map still yields a usable, if unshared, lock.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn load_or_create(&self, session_id: SessionId) -> Result<Session, QueryError> {
        if let Some(session) = self.store.get_session(session_id)? {
            return Ok(session);
        }
        Ok(self
            .store
            .create_session(session_id, self.connector.descriptor())?)
    }

    /// Resolve references; when the rules cannot and a model is available,
    /// ask it to restate the utterance.
    async fn resolve(
        &self,
        utterance: &str,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
        warnings: &mut Vec<String>,
    ) -> (String, bool) {
        let resolution = ReferenceResolver::for_schema(schema).resolve(utterance, window);
        if !resolution.is_unresolved() {
            return (resolution.utterance, resolution.used_references);
        }

        let phrases = resolution.unresolved.join(", ");
        if let (Some(model), false) = (&self.model, window.is_empty()) {
            let context = window.transcript();
            match model
                .complete(&rewrite_prompt(utterance, &context), &context)
                .await
            {
                Ok(completion) if !completion.text.trim().is_empty() => {
                    debug!(rewritten = %completion.text.trim(), "Follow-up rewritten by model");
                    return (completion.text.trim().to_string(), true);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Model could not rewrite follow-up"),
            }
        }
        warnings.push(format!(
            "Could not tell what '{phrases}' refers to; answered the question as written."
        ));
        (resolution.utterance, resolution.used_references)
    }

    async fn answer_general(
        &self,
        question: &str,
        window: &ContextWindow,
        warnings: &mut Vec<String>,
    ) -> String {
        let Some(model) = &self.model else {
            return HELP_TEXT.to_string();
        };
        match model.answer(question, &window.transcript()).await {
            Ok(answer) if !answer.is_empty() => answer,
            Ok(_) => HELP_TEXT.to_string(),
            Err(e) => {
                warn!(error = %e, "General question fell back to help text");
                warnings.push("The language model could not answer; showing help instead.".into());
                HELP_TEXT.to_string()
            }
        }
    }

    async fn execute(&self, sql: &str) -> Result<TabularResult, QueryError> {
        let secs = self.limits.query_timeout_secs;
        match tokio::time::timeout(
            Duration::from_secs(secs),
            self.connector.execute_query_boxed(sql),
        )
        .await
        {
            Ok(result) => result.map_err(connector_error),
            Err(_) => {
                warn!(timeout_secs = secs, "Query timed out");
                Err(QueryError::Timeout(secs))
            }
        }
    }

    /// Append `turn` marked as failed and hand the error back, wrapped in
    /// [`QueryError::Unrecorded`] when the turn could not be stored.
    fn record_failure(&self, mut turn: Turn, error: QueryError) -> QueryError {
        turn.failure = Some(TurnFailure::new(error.kind(), error.to_string()));
        warn!(
            session_id = %turn.session_id,
            turn_id = %turn.turn_id,
            kind = ?error.kind(),
            error = %error,
            "Turn failed"
        );
        match self.store.append_turn(turn.session_id, &turn) {
            Ok(()) => error,
            Err(e) => {
                warn!(error = %e, "Failed to record failed turn");
                QueryError::Unrecorded {
                    error: Box::new(error),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn finish(
        &self,
        turn: Turn,
        result: Option<TabularResult>,
        chart: Option<ChartPayload>,
        answer: Option<String>,
        mut warnings: Vec<String>,
        started: Instant,
    ) -> QueryOutcome {
        let persisted = match self.store.append_turn(turn.session_id, &turn) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Turn not persisted");
                warnings.push("This answer could not be saved to the session history.".into());
                false
            }
        };
        info!(
            session_id = %turn.session_id,
            turn_id = %turn.turn_id,
            classification = %turn.classification,
            rows = result.as_ref().map(|r| r.row_count()).unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn completed"
        );
        QueryOutcome {
            turn,
            result,
            chart,
            answer,
            warnings,
            persisted,
        }
    }
}

fn connector_error(error: ConnectorError) -> QueryError {
    match error {
        ConnectorError::ReadOnlyViolation { fragment, .. } => {
            QueryError::SecurityViolation { fragment }
        }
        other => QueryError::Execution(redact_connection_details(&other.to_string())),
    }
}

fn summarize_turn(turn: &Turn) -> String {
    let sql = turn.generated_sql.as_deref().unwrap_or("none");
    let outcome = match (&turn.failure, &turn.result_summary) {
        (Some(failure), _) => format!("failed: {}", failure.message),
        (None, Some(summary)) => format!("{} rows", summary.row_count),
        (None, None) => "answered".to_string(),
    };
    format!(
        "Last Query: '{}' | Type: {} | SQL: {} | Result: {}",
        turn.raw_utterance, turn.classification, sql, outcome
    )
}
