//! Pipeline orchestration
//!
//! Wires the stages together: route, retrieve, plan, compile, execute,
//! synthesize, finalize. One call per question; batches fan out over a
//! bounded number of workers and come back in input order. A question
//! that blows its time budget degrades to the typed default answer
//! instead of failing the batch.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::error::{CopilotError, Result};
use crate::executor::QueryService;
use crate::finalizer::{Answer, Finalizer};
use crate::llm::TextTransformer;
use crate::observability::{RunLog, RunLogStore};
use crate::planner::Planner;
use crate::question::{AnswerShape, Question};
use crate::repair::{ExecutionLoop, LoopOutcome};
use crate::retrieval::{RetrievalService, Retriever};
use crate::router::{Route, Router};
use crate::schema::SchemaDescription;
use crate::sql::QueryCompiler;
use crate::synthesizer::{self, DataOutcome};

pub struct Pipeline {
    config: PipelineConfig,
    router: Router,
    retriever: Retriever,
    planner: Planner,
    compiler: QueryCompiler,
    exec_loop: ExecutionLoop,
    schema: SchemaDescription,
    query_service: Arc<dyn QueryService>,
    log_store: Arc<RunLogStore>,
}

struct QuestionRun {
    answer: Answer,
    route: Route,
    attempts: u32,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        transformer: Arc<dyn TextTransformer>,
        retrieval: Arc<dyn RetrievalService>,
        query_service: Arc<dyn QueryService>,
        schema: SchemaDescription,
    ) -> Self {
        Pipeline {
            router: Router::new(Arc::clone(&transformer)),
            retriever: Retriever::new(retrieval, config.max_chunks),
            planner: Planner::new(),
            compiler: QueryCompiler::new(Arc::clone(&transformer)),
            exec_loop: ExecutionLoop::new(config.max_attempts, transformer),
            schema,
            query_service,
            log_store: Arc::new(RunLogStore::new()),
            config,
        }
    }

    pub fn log_store(&self) -> Arc<RunLogStore> {
        Arc::clone(&self.log_store)
    }

    /// Answer a single question with no time budget.
    pub async fn answer(&self, question: &Question) -> Result<Answer> {
        let started = Instant::now();
        let mut trace = Vec::new();
        let result = self.answer_inner(question, &mut trace).await;
        self.record(question, &result, trace, started.elapsed().as_millis() as u64);
        result.map(|run| run.answer)
    }

    /// Answer under the configured time budget. On expiry the question
    /// degrades to its typed default answer.
    pub async fn answer_with_timeout(&self, question: &Question) -> Result<Answer> {
        let started = Instant::now();
        let mut trace = Vec::new();
        let outcome =
            tokio::time::timeout(self.config.question_timeout, self.answer_inner(question, &mut trace)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.record(question, &result, trace, elapsed_ms);
                result.map(|run| run.answer)
            }
            Err(_) => {
                warn!(
                    "Question {} exceeded the {}s budget, returning the default answer",
                    question.id,
                    self.config.question_timeout.as_secs()
                );
                trace.push("timeout: budget exhausted".to_string());
                let answer = self.degraded_answer(
                    question,
                    "Processing exceeded the time budget; returning the documented default.",
                );
                self.log_store.add(
                    RunLog::new(&question.id)
                        .with_outcome(false, answer.confidence)
                        .with_elapsed(elapsed_ms)
                        .with_trace(trace),
                );
                Ok(answer)
            }
        }
    }

    /// Process a batch with bounded concurrency. Results come back in
    /// input order regardless of completion order, one entry per
    /// question even when a worker dies before reporting.
    pub async fn run_batch(self: Arc<Self>, questions: Vec<Question>) -> Vec<(String, Result<Answer>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        let ids: Vec<String> = questions.iter().map(|q| q.id.clone()).collect();
        let mut join_set = JoinSet::new();

        for (index, question) in questions.into_iter().enumerate() {
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let answer = pipeline.answer_with_timeout(&question).await;
                (index, answer)
            });
        }

        let mut slots: Vec<Option<Result<Answer>>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, answer)) => slots[index] = Some(answer),
                Err(e) => warn!("Batch worker failed: {}", e),
            }
        }

        ids.into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                let answer = slot.unwrap_or_else(|| {
                    self.log_store.add(
                        RunLog::new(&id)
                            .with_outcome(false, 0.0)
                            .with_trace(vec!["worker: aborted before reporting".to_string()]),
                    );
                    Err(CopilotError::Internal(format!(
                        "worker for question '{}' aborted before reporting",
                        id
                    )))
                });
                (id, answer)
            })
            .collect()
    }

    /// The typed default answer for questions that could not be
    /// processed at all.
    pub fn fallback_answer(&self, question: &Question) -> Answer {
        self.degraded_answer(
            question,
            "Processing failed; returning the documented default.",
        )
    }

    async fn answer_inner(&self, question: &Question, trace: &mut Vec<String>) -> Result<QuestionRun> {
        let shape = AnswerShape::parse(&question.format_hint);

        let decision = self.router.route(question).await;
        trace.push(format!(
            "router: route={} ({})",
            decision.route.as_str(),
            decision.source.as_str()
        ));

        let chunks = if decision.route.needs_documents() {
            let chunks = self.retriever.retrieve(&question.question);
            trace.push(format!("retriever: {} chunks", chunks.len()));
            chunks
        } else {
            Vec::new()
        };

        let plan = self.planner.plan(question, decision.route, &chunks);
        trace.push(format!("planner: {}", plan.summary()));

        let data = if decision.route.needs_data() {
            match self.compiler.compile(question, &plan, &self.schema).await {
                Ok(candidate) => {
                    trace.push(format!("compiler: {}", candidate.text.replace('\n', " ")));
                    let outcome = self
                        .exec_loop
                        .run(candidate, &self.schema, self.query_service.as_ref(), trace)
                        .await;
                    match outcome {
                        LoopOutcome::Succeeded { rows, query, attempts } => {
                            DataOutcome::Rows { rows, query, attempts }
                        }
                        LoopOutcome::Exhausted { query, attempts, last_error } => DataOutcome::Failed {
                            query: Some(query),
                            attempts,
                            error: last_error,
                        },
                    }
                }
                Err(e) => {
                    warn!("Compilation failed for {}: {}", question.id, e);
                    trace.push(format!("compiler: rejected ({})", e));
                    DataOutcome::Failed {
                        query: None,
                        attempts: 0,
                        error: e.to_string(),
                    }
                }
            }
        } else {
            DataOutcome::NotAttempted
        };

        let synthesis = synthesizer::synthesize(question, &shape, &decision, &plan, &chunks, &data);
        trace.push(format!("synthesizer: confidence={:.2}", synthesis.confidence));

        let sql = if decision.route == Route::Document {
            None
        } else {
            data.sql().map(|s| s.to_string())
        };
        let attempts = data.attempts();
        let answer = Finalizer::finalize(question, decision.route, synthesis, sql)?;
        Ok(QuestionRun {
            answer,
            route: decision.route,
            attempts,
        })
    }

    fn record(&self, question: &Question, result: &Result<QuestionRun>, mut trace: Vec<String>, elapsed_ms: u64) {
        let log = match result {
            Ok(run) => RunLog::new(&question.id)
                .with_route(run.route.as_str())
                .with_sql(run.answer.sql.clone())
                .with_attempts(run.attempts)
                .with_outcome(true, run.answer.confidence)
                .with_elapsed(elapsed_ms)
                .with_trace(trace),
            Err(e) => {
                trace.push(format!("error: {}", e));
                RunLog::new(&question.id)
                    .with_outcome(false, 0.0)
                    .with_elapsed(elapsed_ms)
                    .with_trace(trace)
            }
        };
        self.log_store.add(log);
    }

    fn degraded_answer(&self, question: &Question, explanation: &str) -> Answer {
        let shape = AnswerShape::parse(&question.format_hint);
        Answer {
            id: question.id.clone(),
            final_answer: shape.zero_value(),
            sql: None,
            confidence: synthesizer::fallback_confidence(),
            explanation: explanation.to_string(),
            citations: Vec::new(),
        }
    }
}
