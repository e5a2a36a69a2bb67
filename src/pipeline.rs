//! One build invocation, end to end.
//!
//! specification → generation stream → extracted files → verified/repaired
//! files → persisted build record. State is persisted after every durable
//! step: the build row is created before the model call, the file set is
//! overwritten on every completed file, and the terminal status lands even
//! when the deadline forces early abandonment. A crashed or timed-out run
//! is recoverable, never silently lost.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::db::DbHandle;
use crate::deadline::DeadlineGuard;
use crate::errors::PipelineError;
use crate::events::{BuildEvent, EventSink};
use crate::extractor::{ExtractEvent, StreamingFileExtractor};
use crate::llm::GenerativeModel;
use crate::models::{BuildOutput, ProjectSpec};
use crate::prompt::generation_prompt;
use crate::repair::{ProjectVerifier, RepairLoop, RepairOutcome};

pub struct BuildPipeline {
    db: DbHandle,
    model: Arc<dyn GenerativeModel>,
    verifier: Arc<dyn ProjectVerifier>,
    budget: Duration,
    margin: Duration,
}

impl BuildPipeline {
    pub fn new(
        db: DbHandle,
        model: Arc<dyn GenerativeModel>,
        verifier: Arc<dyn ProjectVerifier>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            db,
            model,
            verifier,
            budget: config.build_budget,
            margin: config.deadline_margin,
        }
    }

    /// Run one build for a project. Emits progress into `sink`; client
    /// disconnection is cooperative cancellation — emission and the model
    /// stream stop, but persisted partial state stays.
    pub async fn run(
        &self,
        project_id: i64,
        spec: ProjectSpec,
        sink: &mut EventSink,
    ) -> Result<BuildOutput, PipelineError> {
        let config = self
            .db
            .call(move |db| db.get_build_config(project_id))
            .await?
            .ok_or(PipelineError::MissingBuildConfig { project_id })?;
        let framework = config.framework;

        // Create the build row before any model work so a crash mid-run
        // leaves a recoverable record.
        let config_id = config.id;
        let build = self
            .db
            .call(move |db| db.create_build_output(project_id, config_id))
            .await?;
        let build_id = build.id;

        let guard = DeadlineGuard::new(self.budget, self.margin);
        let prompt = generation_prompt(&spec, &config);

        let files = match self.generate(&prompt, build_id, &guard, sink).await {
            Ok(files) => files,
            Err(e) => {
                let message = e.to_string();
                self.fail(build_id, &message, sink).await;
                return Err(e);
            }
        };

        if files.is_empty() {
            // Hard generation failure: nothing usable, nothing claimed.
            let err = PipelineError::NoFilesGenerated;
            self.fail(build_id, &err.to_string(), sink).await;
            return Err(err);
        }

        // Verification must not start once the remaining budget is inside
        // the safety margin (or the client is gone): the parsed set is
        // authoritative as-is.
        let (files, error) = if guard.should_continue() && !sink.is_cancelled() {
            let report = RepairLoop::new(self.verifier.as_ref(), self.model.as_ref())
                .run(framework, files, &guard, sink)
                .await;
            match report.outcome {
                RepairOutcome::Verified => info!("build {} verified", build_id),
                RepairOutcome::SkippedInfra => info!("build {} delivered unverified (infra)", build_id),
                RepairOutcome::Unverified => {
                    warn!("build {} delivered unverified after {} rounds", build_id, report.rounds)
                }
            }
            let error = match report.outcome {
                RepairOutcome::Unverified => report.last_diagnostics,
                _ => None,
            };
            (report.files, error)
        } else {
            info!("build {} skipping verification (deadline margin reached)", build_id);
            (files, None)
        };

        let completed = {
            let files = files.clone();
            let error = error.clone();
            self.db
                .call(move |db| db.complete_build_output(build_id, &files, error.as_deref()))
                .await?
        };

        sink.emit(BuildEvent::Done {
            build_id,
            file_count: completed.files.len(),
            files: completed.files.clone(),
        });
        Ok(completed)
    }

    /// Consume the generation stream through the extractor, persisting the
    /// file set on every completed file. Stops early when the deadline
    /// margin is crossed or the client disconnects, dropping the stream so
    /// the in-flight model call is aborted rather than awaited.
    async fn generate(
        &self,
        prompt: &str,
        build_id: i64,
        guard: &DeadlineGuard,
        sink: &mut EventSink,
    ) -> Result<Vec<crate::models::GeneratedFile>, PipelineError> {
        let mut stream = self.model.stream_generation(prompt).await?;
        let mut extractor = StreamingFileExtractor::new();

        while guard.should_continue() && !sink.is_cancelled() {
            let Some(delta) = stream.next().await else {
                break;
            };
            match delta {
                Ok(text) => {
                    let events = extractor.feed(&text);
                    self.relay(events, build_id, &extractor, sink);
                }
                Err(e) => {
                    // A truncated stream is not fatal by itself; whatever
                    // was captured is still flushed below.
                    warn!("build {}: model stream error: {}", build_id, e);
                    break;
                }
            }
        }
        drop(stream);

        let events = extractor.finish();
        self.relay(events, build_id, &extractor, sink);
        Ok(extractor.into_files())
    }

    /// Forward extractor events to the client and persist on completion.
    fn relay(
        &self,
        events: Vec<ExtractEvent>,
        build_id: i64,
        extractor: &StreamingFileExtractor,
        sink: &mut EventSink,
    ) {
        for event in events {
            match event {
                ExtractEvent::FileStart { path } => {
                    sink.emit(BuildEvent::FileStart { path });
                }
                ExtractEvent::FileChunk { path, text } => {
                    sink.emit(BuildEvent::FileChunk { path, text });
                }
                ExtractEvent::FileComplete { path, content } => {
                    sink.emit(BuildEvent::FileComplete { path, content });
                    // Fire-and-forget: partial progress must survive a
                    // later failure, but persistence never stalls the scan.
                    let snapshot = extractor.files().to_vec();
                    let db = self.db.clone();
                    tokio::spawn(async move {
                        if let Err(e) = db
                            .call(move |db| db.update_build_files(build_id, &snapshot))
                            .await
                        {
                            warn!("build {}: failed to persist files: {:#}", build_id, e);
                        }
                    });
                }
            }
        }
    }

    async fn fail(&self, build_id: i64, message: &str, sink: &mut EventSink) {
        sink.emit(BuildEvent::Error {
            message: message.to_string(),
        });
        let message = message.to_string();
        if let Err(e) = self
            .db
            .call(move |db| db.fail_build_output(build_id, &message))
            .await
        {
            warn!("build {}: failed to record failure: {:#}", build_id, e);
        }
    }
}
