//! Grammar-driven test-case generation for browser fuzzing.
//!
//! A grammar file describes how to derive style rules, markup and script
//! statements; [`Generator`] walks it to produce statement blocks, and
//! [`document::generate_document`] assembles full pages from a template.
//! Every generated statement keeps a pointer into its derivation tree, so
//! per-statement execution feedback from the target can be attributed to
//! the grammar choices that produced it. Two learned layers consume that
//! feedback: online creator weights inside a session, and an offline
//! invalid-context model trained from dumped artifacts (see the companion
//! training crate).

pub mod artifact;
pub mod document;
pub mod driver;
pub mod error;
pub mod gen;
pub mod grammar;
pub mod model;
pub mod selector;
pub mod tree;

pub use artifact::{FeedbackRecord, StmtRef, TrainingArtifact};
pub use document::{generate_document, Document, DocumentSpec};
pub use driver::{Driver, GrammarSet, Outcome, Session};
pub use error::{GenError, GrammarError, ModelError};
pub use gen::{GeneratedBlock, Generator};
pub use grammar::{GrammarOptions, GrammarStore};
pub use model::{ChainStats, InvalidModel, InvalidTree, RuleId, RuleTable};
pub use selector::Selector;
pub use tree::{DerivationTree, NodeId, NodeKind};
