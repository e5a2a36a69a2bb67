//! Build verification in a disposable working directory.
//!
//! A candidate file set is materialized into a fresh temp dir, then the
//! framework's install and build commands run under their own timeouts.
//! Outcomes are classified three ways: pass, code failure (diagnostics
//! captured for the repair loop), or infrastructure failure (tooling or
//! resource problems — not evidence against the generated code, so the
//! caller skips verification instead of failing the build).

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::models::{Framework, GeneratedFile};

/// Upper bound on captured diagnostics. Build tools can emit megabytes;
/// the repair prompt only needs the tail, where the errors land.
pub const MAX_DIAGNOSTICS_LEN: usize = 8_000;

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Pass,
    /// The generated code failed to compile; recoverable via repair.
    CodeFailure { diagnostics: String },
    /// The sandbox itself failed. Treated as "cannot verify".
    Infra { reason: String },
}

enum StepResult {
    Completed(std::process::Output),
    SpawnFailed(std::io::Error),
    TimedOut(Duration),
}

pub struct BuildVerifier {
    install_timeout: Duration,
    compile_timeout: Duration,
}

impl BuildVerifier {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            install_timeout: config.install_timeout,
            compile_timeout: config.compile_timeout,
        }
    }

    /// Verify one candidate file set. The working directory is removed on
    /// every exit path; a removal failure is logged and never masks the
    /// verification result.
    pub async fn verify(&self, framework: Framework, files: &[GeneratedFile]) -> VerifyOutcome {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return VerifyOutcome::Infra {
                    reason: format!("failed to create working directory: {}", e),
                }
            }
        };

        let outcome = self.verify_in(dir.path(), framework, files).await;

        if let Err(e) = dir.close() {
            warn!("failed to remove verification directory: {}", e);
        }
        outcome
    }

    async fn verify_in(
        &self,
        root: &Path,
        framework: Framework,
        files: &[GeneratedFile],
    ) -> VerifyOutcome {
        if let Err(outcome) = materialize(root, files).await {
            return outcome;
        }

        if let Some((cmd, args)) = framework.install_command() {
            let result = run_step(cmd, args, root, self.install_timeout).await;
            if let Some(outcome) = classify(result, "install") {
                return outcome;
            }
        }

        if let Some((cmd, args)) = framework.build_command() {
            let result = run_step(cmd, args, root, self.compile_timeout).await;
            if let Some(outcome) = classify(result, "build") {
                return outcome;
            }
        }

        VerifyOutcome::Pass
    }
}

/// Write the file set under `root`, creating parent directories. Paths
/// must stay inside the root.
async fn materialize(root: &Path, files: &[GeneratedFile]) -> Result<(), VerifyOutcome> {
    for file in files {
        let Some(relative) = safe_relative_path(&file.path) else {
            return Err(VerifyOutcome::CodeFailure {
                diagnostics: format!("invalid file path: {}", file.path),
            });
        };
        let dest = root.join(relative);
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Err(VerifyOutcome::Infra {
                    reason: format!("failed to create {}: {}", parent.display(), e),
                });
            }
        }
        if let Err(e) = tokio::fs::write(&dest, &file.content).await {
            return Err(VerifyOutcome::Infra {
                reason: format!("failed to write {}: {}", dest.display(), e),
            });
        }
    }
    Ok(())
}

/// Normalize a generated path, rejecting anything that could escape the
/// working directory.
fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None, // absolute prefix, root, or parent traversal
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

async fn run_step(cmd: &str, args: &[&str], dir: &Path, timeout: Duration) -> StepResult {
    let result = tokio::time::timeout(
        timeout,
        Command::new(cmd)
            .args(args)
            .current_dir(dir)
            .env("CI", "1")
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => StepResult::Completed(output),
        Ok(Err(e)) => StepResult::SpawnFailed(e),
        Err(_) => StepResult::TimedOut(timeout),
    }
}

/// Map a step result to an outcome, or None when the step passed.
fn classify(result: StepResult, step: &str) -> Option<VerifyOutcome> {
    match result {
        StepResult::Completed(output) => {
            if output.status.success() {
                return None;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}\n{}", stdout, stderr);
            if is_infra_output(&combined) {
                Some(VerifyOutcome::Infra {
                    reason: format!("{} hit a resource limit", step),
                })
            } else {
                Some(VerifyOutcome::CodeFailure {
                    diagnostics: truncate_diagnostics(&combined),
                })
            }
        }
        StepResult::SpawnFailed(e) => Some(VerifyOutcome::Infra {
            reason: format!("failed to spawn {} command: {}", step, e),
        }),
        // A hung install/build is treated as a code problem: repair gets a
        // chance rather than the whole build aborting.
        StepResult::TimedOut(timeout) => Some(VerifyOutcome::CodeFailure {
            diagnostics: format!("{} step timed out after {}s", step, timeout.as_secs()),
        }),
    }
}

/// Resource-exhaustion markers in tool output that indicate the sandbox,
/// not the generated code, is at fault.
fn is_infra_output(output: &str) -> bool {
    let lowered = output.to_lowercase();
    ["enospc", "no space left on device", "out of memory", "cannot allocate memory", "enomem"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn truncate_diagnostics(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= MAX_DIAGNOSTICS_LEN {
        return trimmed.to_string();
    }
    // Keep the tail; compilers put the actionable errors last.
    let mut start = trimmed.len() - MAX_DIAGNOSTICS_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
