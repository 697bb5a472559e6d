//! Production rule data model.
//!
//! A rule is either a *grammar rule* (`<Tag attrs> = parts...`, pure
//! substitution) or a *code rule* (free text with `<new Type>` markers that
//! becomes one output statement). A rule's identity is its canonical
//! textual form; that string is the dedup key everywhere, including the
//! derivation tree and the trained models.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::grammar::builtins;

/// Index of a rule inside a [`GrammarStore`](crate::grammar::GrammarStore).
pub type RuleIdx = usize;

/// A parsed `<...>` tag: name plus raw attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// `<new Type ...>` marker: this tag declares a fresh variable.
    pub creates_new: bool,
    /// Attribute map; flag attributes (e.g. `nonrecursive`) map to `""`.
    pub attrs: IndexMap<String, String>,
}

impl Tag {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    /// Repeat-reference id, if this tag carries `id=<n>`.
    pub fn repeat_id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// Explicit selection probability from a `p=<float>` attribute.
    pub fn probability(&self) -> Option<f64> {
        self.attr("p").and_then(|p| p.parse().ok())
    }
}

/// One element on the right-hand side of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RulePart {
    /// Literal text, emitted verbatim.
    Text(String),
    /// A tag reference: nonterminal, built-in scalar, constant, `<new T>`,
    /// `<import>`, `<lines>` or `<call>`.
    Tag(Tag),
}

/// Whether a rule is pure substitution or an output statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    Grammar,
    Code,
}

/// A production rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: RuleKind,
    /// Canonical textual form; the rule's identity.
    pub text: String,
    pub parts: Vec<RulePart>,
    /// Tags this rule creates. For a grammar rule this is the single
    /// left-hand tag; for a code rule, every `<new Type>` marker.
    pub creates: Vec<Tag>,
    /// Right-hand side references the created symbol directly.
    pub recursive: bool,
    /// Code rule parsed inside a `!begin helperlines` section; not
    /// registered as a `line` creator.
    pub helper: bool,
}

impl Rule {
    /// The create tag for `symbol`, carrying its `p`/`nonrecursive` attrs.
    pub fn create_tag(&self, symbol: &str) -> Option<&Tag> {
        self.creates.iter().find(|t| t.name == symbol)
    }

    /// The ordered symbol names that occupy derivation-tree slots when this
    /// rule is expanded: nonterminal references, excluding literal text,
    /// built-ins, constants, `<call>`/`<import>` tags, `<new>` markers in
    /// code rules, and repeats of an already-seen `id`.
    pub fn slot_symbols(&self) -> Vec<&str> {
        let mut seen_ids: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for part in &self.parts {
            let tag = match part {
                RulePart::Text(_) => continue,
                RulePart::Tag(tag) => tag,
            };
            if let Some(id) = tag.repeat_id() {
                if seen_ids.contains(&id) {
                    continue;
                }
                seen_ids.push(id);
            }
            if self.kind == RuleKind::Code && tag.creates_new {
                continue;
            }
            if builtins::is_builtin_or_constant(&tag.name) {
                continue;
            }
            if tag.name == "call" || tag.name == "import" {
                continue;
            }
            out.push(tag.name.as_str());
        }
        out
    }

    /// Number of derivation-tree slots this rule owns.
    pub fn slot_count(&self) -> usize {
        self.slot_symbols().len()
    }
}
