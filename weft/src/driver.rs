//! Target-driver boundary and the fuzzing session that sits behind it.
//!
//! Executing a generated case against a real target lives outside this
//! crate; a [`Driver`] implementation supplies that. The [`Session`] here
//! is the in-process side of the loop: generate a case, hand the target's
//! per-statement feedback to the learned-selection layers, and dump a
//! training artifact when tree collection is enabled.

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::artifact::{FeedbackRecord, TrainingArtifact};
use crate::document::{generate_document, DocumentSpec};
use crate::error::{GenError, ModelError};
use crate::gen::Generator;
use crate::grammar::GrammarStore;
use crate::selector::Selector;

/// Outcome label the harness reports for a statement that ran cleanly.
pub const VALID_LABEL: &str = "Valid";

/// What one case execution produced.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub success: bool,
    pub crash_log: Option<String>,
    /// Per-statement outcome labels; `None` means the target reported
    /// nothing this round, which is not an error.
    pub feedback: Option<Vec<FeedbackRecord>>,
}

/// External collaborator that runs a case against the target program.
pub trait Driver {
    fn execute(&mut self, case: &str) -> anyhow::Result<Outcome>;
}

/// Error names that mean "the statement was semantically rejected" rather
/// than crashed or irrelevant.
pub fn is_semantic_error(label: &str) -> bool {
    ["TypeError", "ReferenceError", "NotSupportedError"]
        .iter()
        .any(|name| label.contains(name))
}

/// Scaffolding lines the harness emits around real statements; their
/// outcomes say nothing about grammar choices.
pub fn is_scaffolding(statement: &str) -> bool {
    statement.contains("GetVariable") || statement.contains("SetVariable")
}

/// The three grammars one fuzzing session runs with.
pub struct GrammarSet {
    pub css: GrammarStore,
    pub html: GrammarStore,
    pub js: GrammarStore,
}

/// One long-lived fuzzing session: generates cases and folds execution
/// feedback back into the selection oracle and training artifacts.
pub struct Session {
    grammars: GrammarSet,
    template: String,
    spec: DocumentSpec,
    selector: Selector,
    rng: StdRng,
    /// Trees and statement map of the most recent case, while its
    /// feedback is still outstanding.
    pending: Option<TrainingArtifact>,
    collect_trees: bool,
    artifact_dir: Option<PathBuf>,
}

impl Session {
    pub fn new(grammars: GrammarSet, template: String, selector: Selector, seed: u64) -> Self {
        Session {
            grammars,
            template,
            spec: DocumentSpec::default(),
            selector,
            rng: StdRng::seed_from_u64(seed),
            pending: None,
            collect_trees: false,
            artifact_dir: None,
        }
    }

    pub fn with_spec(mut self, spec: DocumentSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Keep derivation trees and dump them (with feedback) to `dir`.
    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.collect_trees = true;
        self.artifact_dir = Some(dir);
        self
    }

    /// Generate one full test case. The previous case's trees are
    /// replaced; feedback must be submitted before the next call to be
    /// attributed.
    pub fn generate_case(&mut self) -> Result<String, GenError> {
        let css_seed = self.rng.gen();
        let html_seed = self.rng.gen();
        let js_seed = self.rng.gen();
        let mut css = Generator::new(&self.grammars.css, &self.selector, css_seed);
        let mut html = Generator::new(&self.grammars.html, &self.selector, html_seed);
        let mut js = Generator::new(&self.grammars.js, &self.selector, js_seed);

        let doc = generate_document(&self.spec, &self.template, &mut css, &mut html, &mut js)?;

        if self.collect_trees {
            self.pending = Some(TrainingArtifact {
                trees: doc.trees,
                statements: doc.statements,
                feedback: Vec::new(),
            });
        }
        Ok(doc.text)
    }

    /// Attribute one execution's outcome to the pending case: online
    /// weights observe each resolvable statement, and the artifact (if
    /// collection is on) is written out with its feedback attached.
    pub fn submit_feedback(&mut self, outcome: &Outcome) -> Result<(), ModelError> {
        let Some(mut artifact) = self.pending.take() else {
            debug!("feedback with no pending case; ignoring");
            return Ok(());
        };
        let Some(feedback) = &outcome.feedback else {
            return Ok(());
        };

        let mut total = 0usize;
        let mut failures = 0usize;
        for record in feedback {
            if is_scaffolding(&record.statement) {
                continue;
            }
            // Only a semantic rejection counts against the grammar
            // choice; unrelated exception types ran far enough to pass.
            let success = !is_semantic_error(&record.label);
            total += 1;
            if !success {
                failures += 1;
            }

            if let Some(weights) = self.selector.online_mut() {
                if let Some(stmt) = artifact.statements.get(&record.statement) {
                    let tree = &artifact.trees[stmt.tree as usize];
                    weights.observe(&self.grammars.js, tree, stmt.node, success);
                }
            }
            artifact.push_feedback(&record.statement, &record.label);
        }
        if total > 0 {
            info!(
                failures,
                total,
                rate = failures as f64 / total as f64,
                "statement feedback processed"
            );
        }

        if let Some(dir) = &self.artifact_dir {
            if !artifact.feedback.is_empty() {
                match artifact.save_new(dir) {
                    Ok(path) => debug!(path = %path.display(), "training artifact written"),
                    Err(err) => warn!(%err, "failed to write training artifact"),
                }
            }
        }
        Ok(())
    }

    /// Write the pending artifact out as-is, with whatever feedback it
    /// has. For callers that execute cases out of process and cannot
    /// route feedback back through [`submit_feedback`](Self::submit_feedback).
    pub fn flush_artifact(&mut self) -> Result<Option<PathBuf>, ModelError> {
        let Some(artifact) = self.pending.take() else {
            return Ok(None);
        };
        let Some(dir) = &self.artifact_dir else {
            return Ok(None);
        };
        artifact.save_new(dir).map(Some)
    }

    /// Fold the accumulated feedback batch into the online weights.
    pub fn apply_batch(&mut self) {
        if let Some(weights) = self.selector.online_mut() {
            weights.finish_batch();
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}
