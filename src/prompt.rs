//! Prompt assembly for generation and repair calls.

use crate::models::{BuildConfig, Framework, GeneratedFile, ProjectSpec};

/// Framing rules shared by the generation and repair prompts. The
/// extractor's state machine is defined purely in terms of these markers.
pub const FILE_FORMAT_RULES: &str = r#"Output every file using exactly this framing, with no other commentary between files:

===FILE: relative/path/to/file===
<complete file content>
===END FILE===

Rules:
- Emit complete, deployable files only. No placeholders, no "rest unchanged".
- Paths are relative to the project root, forward slashes, no leading "./".
- Emit each path at most once.
"#;

/// Build the generation prompt from the assembled project brief.
pub fn generation_prompt(spec: &ProjectSpec, config: &BuildConfig) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are generating a complete, deployable {} web project",
        framework_label(config.framework)
    ));
    if config.typescript {
        prompt.push_str(" in TypeScript");
    }
    prompt.push_str(&format!(", styled with {}.\n\n", config.styling));

    prompt.push_str(&format!("# Project: {}\n\n", spec.name));
    if !spec.description.is_empty() {
        prompt.push_str(&format!("{}\n\n", spec.description));
    }

    if !spec.features.is_empty() {
        prompt.push_str("## Features\n\n");
        for feature in &spec.features {
            prompt.push_str(&format!("- {}\n", feature));
        }
        prompt.push('\n');
    }

    if !spec.pages.is_empty() {
        prompt.push_str("## Pages\n\n");
        for page in &spec.pages {
            prompt.push_str(&format!("- {} ({})", page.name, page.path));
            if !page.description.is_empty() {
                prompt.push_str(&format!(": {}", page.description));
            }
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if !spec.flows.is_empty() {
        prompt.push_str("## Navigation flows\n\n");
        for flow in &spec.flows {
            prompt.push_str(&format!("- {}\n", flow));
        }
        prompt.push('\n');
    }

    if !spec.design_notes.is_empty() {
        prompt.push_str("## Visual design\n\n");
        prompt.push_str(&spec.design_notes);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&build_requirements(config.framework));
    prompt.push('\n');
    prompt.push_str(FILE_FORMAT_RULES);
    prompt
}

/// Build the narrower repair prompt: diagnostics plus current files, asking
/// for only the files that need to change.
pub fn repair_prompt(diagnostics: &str, files: &[GeneratedFile]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "The project you generated fails to build. Fix the errors below and \
         return ONLY the files that need to change, complete, in the same \
         file framing. Do not return unchanged files.\n\n",
    );
    prompt.push_str("## Build errors\n\n```\n");
    prompt.push_str(diagnostics);
    prompt.push_str("\n```\n\n## Current files\n\n");
    for file in files {
        prompt.push_str(&format!(
            "===FILE: {}===\n{}\n===END FILE===\n",
            file.path, file.content
        ));
    }
    prompt.push('\n');
    prompt.push_str(FILE_FORMAT_RULES);
    prompt
}

fn framework_label(framework: Framework) -> &'static str {
    match framework {
        Framework::Nextjs => "Next.js",
        Framework::Vite => "Vite + React",
        Framework::Static => "static HTML/CSS/JS",
    }
}

fn build_requirements(framework: Framework) -> String {
    match framework {
        Framework::Nextjs => "## Build requirements\n\n\
             - Include package.json with all dependencies and a `build` script (`next build`).\n\
             - Include next.config.js and tsconfig.json as needed.\n\
             - The project must pass `npm install` and `npm run build` with no errors.\n"
            .to_string(),
        Framework::Vite => "## Build requirements\n\n\
             - Include package.json with all dependencies and a `build` script (`vite build`).\n\
             - Include index.html at the root and vite.config as needed.\n\
             - The project must pass `npm install` and `npm run build` with no errors.\n"
            .to_string(),
        Framework::Static => "## Build requirements\n\n\
             - Plain HTML/CSS/JS only, no build step. index.html is the entry point.\n"
            .to_string(),
    }
}
