//! Bounded verify→fix loop.
//!
//! Each round verifies the current file set, and on a code failure asks
//! the model for a narrower patch: diagnostics plus current files in, only
//! changed files out. Returned fixes merge by path; unmentioned files stay
//! untouched. The loop delivers its best file set even when rounds run
//! out — an unverified build beats none.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::deadline::DeadlineGuard;
use crate::events::{BuildEvent, EventSink};
use crate::extractor::StreamingFileExtractor;
use crate::llm::GenerativeModel;
use crate::models::{Framework, GeneratedFile};
use crate::prompt::repair_prompt;
use crate::verifier::{BuildVerifier, VerifyOutcome};

pub const MAX_FIX_ITERATIONS: u32 = 3;

/// Verification seam, so the loop is testable without npm.
#[async_trait]
pub trait ProjectVerifier: Send + Sync {
    async fn verify(&self, framework: Framework, files: &[GeneratedFile]) -> VerifyOutcome;
}

#[async_trait]
impl ProjectVerifier for BuildVerifier {
    async fn verify(&self, framework: Framework, files: &[GeneratedFile]) -> VerifyOutcome {
        BuildVerifier::verify(self, framework, files).await
    }
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// The build compiled.
    Verified,
    /// The sandbox could not verify; the files pass optimistically.
    SkippedInfra,
    /// Rounds, deadline, or fixes ran out; files are delivered unverified.
    Unverified,
}

#[derive(Debug)]
pub struct RepairReport {
    pub files: Vec<GeneratedFile>,
    pub outcome: RepairOutcome,
    /// Verification rounds actually executed.
    pub rounds: u32,
    pub last_diagnostics: Option<String>,
}

pub struct RepairLoop<'a> {
    verifier: &'a dyn ProjectVerifier,
    model: &'a dyn GenerativeModel,
}

impl<'a> RepairLoop<'a> {
    pub fn new(verifier: &'a dyn ProjectVerifier, model: &'a dyn GenerativeModel) -> Self {
        Self { verifier, model }
    }

    pub async fn run(
        &self,
        framework: Framework,
        mut files: Vec<GeneratedFile>,
        guard: &DeadlineGuard,
        sink: &mut EventSink,
    ) -> RepairReport {
        let mut last_diagnostics = None;

        for iteration in 1..=MAX_FIX_ITERATIONS {
            if !guard.should_continue() || sink.is_cancelled() {
                return RepairReport {
                    files,
                    outcome: RepairOutcome::Unverified,
                    rounds: iteration - 1,
                    last_diagnostics,
                };
            }

            sink.emit(BuildEvent::Verify {
                message: format!("Verifying build (attempt {})", iteration),
                iteration,
            });

            let diagnostics = match self.verifier.verify(framework, &files).await {
                VerifyOutcome::Pass => {
                    return RepairReport {
                        files,
                        outcome: RepairOutcome::Verified,
                        rounds: iteration,
                        last_diagnostics,
                    };
                }
                VerifyOutcome::Infra { reason } => {
                    // Inability to verify is not evidence of incorrect code.
                    warn!("skipping verification: {}", reason);
                    return RepairReport {
                        files,
                        outcome: RepairOutcome::SkippedInfra,
                        rounds: iteration,
                        last_diagnostics,
                    };
                }
                VerifyOutcome::CodeFailure { diagnostics } => diagnostics,
            };

            sink.emit(BuildEvent::VerifyFailed {
                errors: diagnostics.clone(),
                iteration,
                max_iterations: MAX_FIX_ITERATIONS,
            });
            last_diagnostics = Some(diagnostics.clone());

            // No fix after the final round, and none once the deadline margin
            // is crossed.
            if iteration == MAX_FIX_ITERATIONS || !guard.should_continue() {
                return RepairReport {
                    files,
                    outcome: RepairOutcome::Unverified,
                    rounds: iteration,
                    last_diagnostics,
                };
            }

            sink.emit(BuildEvent::Fixing { iteration });
            let fixes = match self.request_fixes(&diagnostics, &files).await {
                Ok(fixes) => fixes,
                Err(e) => {
                    warn!("fix call failed, delivering current files: {}", e);
                    return RepairReport {
                        files,
                        outcome: RepairOutcome::Unverified,
                        rounds: iteration,
                        last_diagnostics,
                    };
                }
            };

            if fixes.is_empty() {
                info!("model returned no fixes, stopping repair early");
                return RepairReport {
                    files,
                    outcome: RepairOutcome::Unverified,
                    rounds: iteration,
                    last_diagnostics,
                };
            }

            merge_fixes(&mut files, fixes);
        }

        RepairReport {
            files,
            outcome: RepairOutcome::Unverified,
            rounds: MAX_FIX_ITERATIONS,
            last_diagnostics,
        }
    }

    async fn request_fixes(
        &self,
        diagnostics: &str,
        files: &[GeneratedFile],
    ) -> Result<Vec<GeneratedFile>, crate::errors::PipelineError> {
        let response = self
            .model
            .complete(&repair_prompt(diagnostics, files))
            .await?;
        let mut extractor = StreamingFileExtractor::new();
        extractor.feed(&response);
        extractor.finish();
        Ok(extractor.into_files())
    }
}

/// Merge by path: replace-if-present, append-if-new. Files the model did
/// not mention are left exactly as they were.
fn merge_fixes(files: &mut Vec<GeneratedFile>, fixes: Vec<GeneratedFile>) {
    for fix in fixes {
        if let Some(existing) = files.iter_mut().find(|f| f.path == fix.path) {
            existing.content = fix.content;
        } else {
            files.push(fix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::llm::DeltaStream;
    use std::sync::Mutex;
    use std::time::Duration;

    struct MockVerifier {
        outcomes: Mutex<Vec<VerifyOutcome>>,
        calls: Mutex<u32>,
    }

    impl MockVerifier {
        fn new(outcomes: Vec<VerifyOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProjectVerifier for MockVerifier {
        async fn verify(&self, _framework: Framework, _files: &[GeneratedFile]) -> VerifyOutcome {
            *self.calls.lock().unwrap() += 1;
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                VerifyOutcome::CodeFailure {
                    diagnostics: "still broken".into(),
                }
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct MockModel {
        responses: Mutex<Vec<String>>,
        fix_calls: Mutex<u32>,
    }

    impl MockModel {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                fix_calls: Mutex::new(0),
            }
        }

        fn fix_calls(&self) -> u32 {
            *self.fix_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GenerativeModel for MockModel {
        async fn stream_generation(&self, _prompt: &str) -> Result<DeltaStream, PipelineError> {
            unimplemented!("not used by the repair loop")
        }

        async fn complete(&self, _prompt: &str) -> Result<String, PipelineError> {
            *self.fix_calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn sink() -> (EventSink, tokio::sync::mpsc::UnboundedReceiver<BuildEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (EventSink::new(tx), rx)
    }

    fn guard() -> DeadlineGuard {
        DeadlineGuard::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    fn initial_files() -> Vec<GeneratedFile> {
        vec![
            GeneratedFile::new("package.json", "{}"),
            GeneratedFile::new("src/App.tsx", "broken"),
        ]
    }

    const FIX_APP: &str = "===FILE: src/App.tsx===\nfixed v1\n===END FILE===";
    const FIX_APP_V2: &str = "===FILE: src/App.tsx===\nfixed v2\n===END FILE===";

    #[tokio::test]
    async fn test_pass_first_round_makes_no_fix_calls() {
        let verifier = MockVerifier::new(vec![VerifyOutcome::Pass]);
        let model = MockModel::new(vec![]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Verified);
        assert_eq!(report.rounds, 1);
        assert_eq!(model.fix_calls(), 0);
    }

    #[tokio::test]
    async fn test_fails_twice_passes_third() {
        // Two code failures then a pass, within the 3-round bound. Final
        // files equal the twice-repaired set; no further fix call occurs.
        let verifier = MockVerifier::new(vec![
            VerifyOutcome::CodeFailure {
                diagnostics: "err one".into(),
            },
            VerifyOutcome::CodeFailure {
                diagnostics: "err two".into(),
            },
            VerifyOutcome::Pass,
        ]);
        let model = MockModel::new(vec![FIX_APP, FIX_APP_V2]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Verified);
        assert_eq!(report.rounds, 3);
        assert_eq!(model.fix_calls(), 2);
        let app = report.files.iter().find(|f| f.path == "src/App.tsx").unwrap();
        assert_eq!(app.content, "fixed v2");
        // Unmentioned file untouched.
        let pkg = report.files.iter().find(|f| f.path == "package.json").unwrap();
        assert_eq!(pkg.content, "{}");
    }

    #[tokio::test]
    async fn test_repeated_failure_bounds_fix_calls() {
        let verifier = MockVerifier::new(vec![]);
        let model = MockModel::new(vec![FIX_APP, FIX_APP_V2, FIX_APP, FIX_APP_V2]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Unverified);
        assert_eq!(verifier.calls(), MAX_FIX_ITERATIONS);
        assert!(model.fix_calls() <= MAX_FIX_ITERATIONS);
        assert_eq!(model.fix_calls(), MAX_FIX_ITERATIONS - 1);
        assert!(report.last_diagnostics.is_some());
    }

    #[tokio::test]
    async fn test_infra_failure_short_circuits_optimistically() {
        let verifier = MockVerifier::new(vec![VerifyOutcome::Infra {
            reason: "npm missing".into(),
        }]);
        let model = MockModel::new(vec![]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::SkippedInfra);
        assert_eq!(model.fix_calls(), 0);
        assert_eq!(report.files, initial_files());
    }

    #[tokio::test]
    async fn test_empty_fix_response_stops_early() {
        let verifier = MockVerifier::new(vec![]);
        let model = MockModel::new(vec!["I could not find anything to change."]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Unverified);
        assert_eq!(verifier.calls(), 1);
        assert_eq!(model.fix_calls(), 1);
    }

    #[tokio::test]
    async fn test_fix_adds_new_file() {
        let verifier = MockVerifier::new(vec![
            VerifyOutcome::CodeFailure {
                diagnostics: "missing module".into(),
            },
            VerifyOutcome::Pass,
        ]);
        let model = MockModel::new(vec![
            "===FILE: src/lib/util.ts===\nexport const x = 1;\n===END FILE===",
        ]);
        let (mut sink, _rx) = sink();

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Verified);
        assert_eq!(report.files.len(), 3);
        assert_eq!(report.files[2].path, "src/lib/util.ts");
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_verification_entirely() {
        let verifier = MockVerifier::new(vec![VerifyOutcome::Pass]);
        let model = MockModel::new(vec![]);
        let (mut sink, _rx) = sink();
        let expired = DeadlineGuard::new(Duration::from_secs(10), Duration::from_secs(30));

        let report = RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &expired, &mut sink)
            .await;

        assert_eq!(report.outcome, RepairOutcome::Unverified);
        assert_eq!(report.rounds, 0);
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_events_carry_iteration_numbers() {
        let verifier = MockVerifier::new(vec![
            VerifyOutcome::CodeFailure {
                diagnostics: "boom".into(),
            },
            VerifyOutcome::Pass,
        ]);
        let model = MockModel::new(vec![FIX_APP]);
        let (mut sink, mut rx) = sink();

        RepairLoop::new(&verifier, &model)
            .run(Framework::Vite, initial_files(), &guard(), &mut sink)
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events[0],
            BuildEvent::Verify { iteration: 1, .. }
        ));
        assert!(matches!(
            events[1],
            BuildEvent::VerifyFailed {
                iteration: 1,
                max_iterations: MAX_FIX_ITERATIONS,
                ..
            }
        ));
        assert!(matches!(events[2], BuildEvent::Fixing { iteration: 1 }));
        assert!(matches!(
            events[3],
            BuildEvent::Verify { iteration: 2, .. }
        ));
    }

    #[test]
    fn test_merge_fixes_replaces_and_appends() {
        let mut files = vec![
            GeneratedFile::new("a.txt", "old a"),
            GeneratedFile::new("b.txt", "old b"),
        ];
        merge_fixes(
            &mut files,
            vec![
                GeneratedFile::new("b.txt", "new b"),
                GeneratedFile::new("c.txt", "new c"),
            ],
        );
        assert_eq!(
            files,
            vec![
                GeneratedFile::new("a.txt", "old a"),
                GeneratedFile::new("b.txt", "new b"),
                GeneratedFile::new("c.txt", "new c"),
            ]
        );
    }
}
