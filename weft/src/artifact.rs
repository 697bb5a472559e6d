//! Per-session training artifacts.
//!
//! A generating worker that runs with tree collection enabled dumps one
//! artifact per session: the derivation trees it produced, a map from
//! emitted statement text back to the node that produced it, and the
//! feedback labels the target reported per statement. The offline
//! statistics job consumes directories full of these files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{load_envelope, save_envelope};
use crate::tree::{DerivationTree, NodeId};

pub const ARTIFACT_MAGIC: [u8; 4] = *b"WFTA";
/// File extension the statistics job scans for.
pub const ARTIFACT_EXT: &str = "wft";

/// Location of a statement's generating node: tree index plus node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtRef {
    pub tree: u32,
    pub node: NodeId,
}

/// One (statement text, outcome label) report from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub statement: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub trees: Vec<DerivationTree>,
    /// Exact emitted statement text to generating node. Identical text
    /// from different expansions collides; the last writer wins.
    pub statements: FxHashMap<String, StmtRef>,
    pub feedback: Vec<FeedbackRecord>,
}

impl TrainingArtifact {
    /// The tree and node that produced `statement`, if it was recorded.
    pub fn resolve(&self, statement: &str) -> Option<(&DerivationTree, NodeId)> {
        let stmt = self.statements.get(statement)?;
        let tree = self.trees.get(stmt.tree as usize)?;
        Some((tree, stmt.node))
    }

    pub fn push_feedback(&mut self, statement: &str, label: &str) {
        self.feedback.push(FeedbackRecord {
            statement: statement.to_string(),
            label: label.to_string(),
        });
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_envelope(path, ARTIFACT_MAGIC, self)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        load_envelope(path, ARTIFACT_MAGIC)
    }

    /// Save under a fresh collision-free name in `dir` and return the
    /// path. Names combine the process id, a timestamp and an in-process
    /// counter, so parallel workers sharing a directory never clash.
    pub fn save_new(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let name = format!(
            "session-{}-{}-{}.{ARTIFACT_EXT}",
            std::process::id(),
            nanos,
            SEQ.fetch_add(1, Ordering::Relaxed),
        );
        let path = dir.join(name);
        self.save(&path)?;
        Ok(path)
    }
}
