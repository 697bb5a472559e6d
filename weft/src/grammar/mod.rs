//! Grammar store: parsed production rules, frozen for read-only sharing.
//!
//! A [`GrammarStore`] is built once at startup from one or more
//! rule-definition files (see `parser`), pruned of unreachable symbols,
//! normalized into per-symbol cumulative distributions, and then never
//! mutated again. Workers share it read-only; all generation state lives
//! in per-case contexts.

pub mod builtins;
mod parser;
mod prune;
pub mod rules;

use std::path::Path;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::error::GrammarError;
pub use builtins::CallbackFn;
pub use rules::{Rule, RuleIdx, RuleKind, RulePart, Tag};

/// The symbol every output statement is derived from.
pub const LINE_SYMBOL: &str = "line";

/// Variable naming format parsed from `!varformat` (e.g. `var%05d`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarFormat {
    prefix: String,
    width: usize,
}

impl VarFormat {
    pub fn parse(s: &str) -> Result<Self, GrammarError> {
        let s = s.trim();
        let percent = s.find('%').ok_or_else(|| GrammarError::DirectiveArgument {
            directive: "varformat".into(),
            message: format!("`{s}` has no %0Nd placeholder"),
        })?;
        let (prefix, spec) = s.split_at(percent);
        let digits: String = spec[1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !spec.ends_with('d') {
            return Err(GrammarError::DirectiveArgument {
                directive: "varformat".into(),
                message: format!("`{s}` placeholder must end in d"),
            });
        }
        let width = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| GrammarError::DirectiveArgument {
                directive: "varformat".into(),
                message: format!("bad width in `{s}`"),
            })?
        };
        Ok(VarFormat {
            prefix: prefix.to_string(),
            width,
        })
    }

    pub fn format(&self, n: u32) -> String {
        format!("{}{:0width$}", self.prefix, n, width = self.width)
    }
}

impl Default for VarFormat {
    fn default() -> Self {
        VarFormat {
            prefix: "var".into(),
            width: 5,
        }
    }
}

/// Per-store behavior switches, fixed at load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrammarOptions {
    /// Wrap each emitted statement in the try/catch feedback harness.
    pub script_harness: bool,
    /// Run reachability and cycle pruning after parsing.
    pub prune: bool,
}

/// Default probability of reusing a live variable instead of creating one.
const DEFAULT_VAR_REUSE_PROB: f64 = 0.75;
/// Reuse probability when a trained invalid tree is active; lower so the
/// learned pruning sees more fresh expansions.
const INVALID_TREE_VAR_REUSE_PROB: f64 = 0.1;

/// A frozen grammar: rules, symbol indexes and sampling tables.
#[derive(Clone)]
pub struct GrammarStore {
    pub(crate) rules: Vec<Rule>,
    /// symbol -> producing rules, sorted by canonical rule text.
    pub(crate) creators: IndexMap<String, Vec<RuleIdx>>,
    pub(crate) nonrecursive: FxHashMap<String, Vec<RuleIdx>>,
    cdfs: FxHashMap<String, Vec<f64>>,
    nonrec_cdfs: FxHashMap<String, Vec<f64>>,
    pub(crate) root: Option<String>,
    pub(crate) var_format: VarFormat,
    pub(crate) line_guard: Option<String>,
    pub(crate) max_recursion: usize,
    pub(crate) var_reuse_prob: f64,
    /// symbol -> indices into `creators["line"]` of lines touching it.
    interesting_lines: FxHashMap<String, Vec<usize>>,
    pub(crate) inheritance: FxHashMap<String, Vec<String>>,
    pub(crate) imports: FxHashMap<String, GrammarStore>,
    pub(crate) callbacks: FxHashMap<String, CallbackFn>,
    rule_index: FxHashMap<String, RuleIdx>,
    /// `!include` arguments already processed, to break include cycles.
    pub(crate) included: rustc_hash::FxHashSet<String>,
    options: GrammarOptions,
}

impl GrammarStore {
    fn empty(options: GrammarOptions) -> Self {
        GrammarStore {
            rules: Vec::new(),
            creators: IndexMap::new(),
            nonrecursive: FxHashMap::default(),
            cdfs: FxHashMap::default(),
            nonrec_cdfs: FxHashMap::default(),
            root: None,
            var_format: VarFormat::default(),
            line_guard: None,
            max_recursion: 50,
            var_reuse_prob: DEFAULT_VAR_REUSE_PROB,
            interesting_lines: FxHashMap::default(),
            inheritance: FxHashMap::default(),
            imports: FxHashMap::default(),
            callbacks: FxHashMap::default(),
            rule_index: FxHashMap::default(),
            included: rustc_hash::FxHashSet::default(),
            options,
        }
    }

    /// Parse a grammar from a file and freeze it.
    pub fn from_file(path: &Path, options: GrammarOptions) -> Result<Self, GrammarError> {
        Self::from_file_with_callbacks(path, options, &[])
    }

    /// Parse a grammar from a file with a registered callback table.
    pub fn from_file_with_callbacks(
        path: &Path,
        options: GrammarOptions,
        callbacks: &[(&str, CallbackFn)],
    ) -> Result<Self, GrammarError> {
        let mut store = Self::empty(options);
        for (name, f) in callbacks {
            store.callbacks.insert((*name).to_string(), *f);
        }
        parser::parse_file(&mut store, path)?;
        store.freeze()?;
        Ok(store)
    }

    /// Parse a grammar from a string (no `!include` resolution directory).
    pub fn from_str(text: &str, options: GrammarOptions) -> Result<Self, GrammarError> {
        Self::from_str_with_callbacks(text, options, &[])
    }

    pub fn from_str_with_callbacks(
        text: &str,
        options: GrammarOptions,
        callbacks: &[(&str, CallbackFn)],
    ) -> Result<Self, GrammarError> {
        let mut store = Self::empty(options);
        for (name, f) in callbacks {
            store.callbacks.insert((*name).to_string(), *f);
        }
        parser::parse_str(&mut store, text, Path::new("."))?;
        store.freeze()?;
        Ok(store)
    }

    /// Register a parsed rule, deduplicating by canonical text.
    pub(crate) fn add_rule(&mut self, rule: Rule) -> RuleIdx {
        if let Some(&idx) = self.rule_index.get(&rule.text) {
            return idx;
        }
        let idx = self.rules.len();
        self.rule_index.insert(rule.text.clone(), idx);

        match rule.kind {
            RuleKind::Grammar => {
                let tag = rule.creates[0].clone();
                self.register_creator(&tag.name, idx);
                if tag.has("nonrecursive") {
                    self.nonrecursive.entry(tag.name.clone()).or_default().push(idx);
                }
                if tag.has("root") {
                    self.root = Some(tag.name.clone());
                }
            }
            RuleKind::Code => {
                for tag in rule.creates.clone() {
                    if builtins::is_noninteresting(&tag.name) {
                        continue;
                    }
                    self.register_creator(&tag.name, idx);
                    if tag.has("nonrecursive") {
                        self.nonrecursive.entry(tag.name.clone()).or_default().push(idx);
                    }
                }
                if !rule.helper {
                    self.register_creator(LINE_SYMBOL, idx);
                }
            }
        }
        self.rules.push(rule);
        idx
    }

    fn register_creator(&mut self, symbol: &str, idx: RuleIdx) {
        self.creators.entry(symbol.to_string()).or_default().push(idx);
    }

    /// Post-parse pass: prune, sort, normalize probabilities, index
    /// interesting lines, validate callback references.
    fn freeze(&mut self) -> Result<(), GrammarError> {
        for rule in &self.rules {
            for part in &rule.parts {
                if let RulePart::Tag(tag) = part {
                    if tag.name == "call" {
                        let name = tag.attr("function").ok_or_else(|| GrammarError::Rule {
                            line: rule.text.clone(),
                            message: "call tag without a function attribute".into(),
                        })?;
                        if !self.callbacks.contains_key(name) {
                            return Err(GrammarError::UnknownFunction { name: name.into() });
                        }
                    }
                }
            }
        }

        if self.options.prune {
            prune::remove_unreachable(self);
            prune::remove_cyclic(self);
            prune::remove_unreachable(self);
        }

        // Deterministic creator order: sorted by canonical rule text.
        let rules = &self.rules;
        for (_, idxs) in self.creators.iter_mut() {
            idxs.sort_by(|&a, &b| rules[a].text.cmp(&rules[b].text));
            idxs.dedup();
        }
        for idxs in self.nonrecursive.values_mut() {
            idxs.sort_by(|&a, &b| rules[a].text.cmp(&rules[b].text));
            idxs.dedup();
        }

        self.normalize_probabilities();
        self.compute_interesting_lines();
        Ok(())
    }

    /// Cumulative distribution for one symbol's creator list, or `None`
    /// when no creator declares a probability (uniform sampling is
    /// cheaper). Explicit probabilities are used directly; if their sum
    /// exceeds 1 (or every creator is explicit) all are rescaled
    /// proportionally, otherwise the residual mass is split evenly among
    /// the implicit creators.
    fn cdf_for_creators(&self, symbol: &str, idxs: &[RuleIdx]) -> Option<Vec<f64>> {
        if symbol == LINE_SYMBOL {
            // Line selection is uniform (or interesting-line biased).
            return None;
        }
        let mut probs = Vec::with_capacity(idxs.len());
        let mut defined = Vec::with_capacity(idxs.len());
        let mut any_defined = false;
        for &idx in idxs {
            let p = self.rules[idx]
                .create_tag(symbol)
                .and_then(Tag::probability);
            match p {
                Some(p) => {
                    probs.push(p);
                    defined.push(true);
                    any_defined = true;
                }
                None => {
                    probs.push(0.0);
                    defined.push(false);
                }
            }
        }
        if !any_defined {
            return None;
        }

        let explicit_sum: f64 = probs.iter().sum();
        let implicit_count = defined.iter().filter(|d| !**d).count();
        let (norm_factor, implicit_value) = if explicit_sum > 1.0 || implicit_count == 0 {
            (1.0 / explicit_sum, 0.0)
        } else {
            (1.0, (1.0 - explicit_sum) / implicit_count as f64)
        };

        let mut cdf = Vec::with_capacity(probs.len());
        let mut acc = 0.0;
        for (p, defined) in probs.iter().zip(&defined) {
            acc += if *defined { p * norm_factor } else { implicit_value };
            cdf.push(acc);
        }
        Some(cdf)
    }

    fn normalize_probabilities(&mut self) {
        let mut cdfs = FxHashMap::default();
        for (symbol, idxs) in &self.creators {
            if let Some(cdf) = self.cdf_for_creators(symbol, idxs) {
                cdfs.insert(symbol.clone(), cdf);
            }
        }
        self.cdfs = cdfs;

        let mut nonrec = FxHashMap::default();
        for (symbol, idxs) in &self.nonrecursive {
            if let Some(cdf) = self.cdf_for_creators(symbol, idxs) {
                nonrec.insert(symbol.clone(), cdf);
            }
        }
        self.nonrec_cdfs = nonrec;
    }

    /// Index which `line` creators reference which live-variable types, so
    /// generation can bias toward lines that exercise existing variables.
    fn compute_interesting_lines(&mut self) {
        self.interesting_lines.clear();
        let Some(lines) = self.creators.get(LINE_SYMBOL) else {
            return;
        };
        for (i, &idx) in lines.iter().enumerate() {
            for part in &self.rules[idx].parts {
                let RulePart::Tag(tag) = part else { continue };
                if tag.creates_new
                    || builtins::is_builtin_or_constant(&tag.name)
                    || builtins::is_noninteresting(&tag.name)
                    || tag.name == "call"
                {
                    continue;
                }
                self.interesting_lines
                    .entry(tag.name.clone())
                    .or_default()
                    .push(i);
            }
        }
    }

    // --- read-only accessors -------------------------------------------

    pub fn options(&self) -> &GrammarOptions {
        &self.options
    }

    pub fn rule(&self, idx: RuleIdx) -> &Rule {
        &self.rules[idx]
    }

    pub fn rule_by_text(&self, text: &str) -> Option<RuleIdx> {
        self.rule_index.get(text).copied()
    }

    pub fn creators_for(&self, symbol: &str) -> Option<&[RuleIdx]> {
        self.creators.get(symbol).map(Vec::as_slice)
    }

    pub fn nonrecursive_for(&self, symbol: &str) -> Option<&[RuleIdx]> {
        self.nonrecursive.get(symbol).map(Vec::as_slice)
    }

    /// CDF aligned with [`creators_for`]; `None` means uniform.
    pub fn cdf_for(&self, symbol: &str) -> Option<&[f64]> {
        self.cdfs.get(symbol).map(Vec::as_slice)
    }

    pub fn nonrec_cdf_for(&self, symbol: &str) -> Option<&[f64]> {
        self.nonrec_cdfs.get(symbol).map(Vec::as_slice)
    }

    /// Position of a creator (by canonical text) within the sorted
    /// creator list for `symbol`.
    pub fn creator_position(&self, symbol: &str, rule_text: &str) -> Option<usize> {
        let idxs = self.creators.get(symbol)?;
        idxs.binary_search_by(|&i| self.rules[i].text.as_str().cmp(rule_text))
            .ok()
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn import(&self, name: &str) -> Option<&GrammarStore> {
        self.imports.get(name)
    }

    /// Register a sub-grammar under `name` for `<import from=name>` tags.
    /// Complements the `!import` directive for grammars wired together at
    /// startup rather than from rule files.
    pub fn add_import(&mut self, name: &str, grammar: GrammarStore) {
        self.imports.insert(name.to_string(), grammar);
    }

    pub fn max_recursion(&self) -> usize {
        self.max_recursion
    }

    pub fn var_reuse_prob(&self) -> f64 {
        self.var_reuse_prob
    }

    /// Drop the reuse probability to the trained-model setting.
    pub fn set_invalid_tree_reuse_prob(&mut self) {
        self.var_reuse_prob = INVALID_TREE_VAR_REUSE_PROB;
    }

    pub fn line_guard(&self) -> Option<&str> {
        self.line_guard.as_deref()
    }

    pub fn var_format(&self) -> &VarFormat {
        &self.var_format
    }

    pub fn interesting_lines_for(&self, symbol: &str) -> Option<&[usize]> {
        self.interesting_lines.get(symbol).map(Vec::as_slice)
    }

    /// Parent types a freshly created variable of `var_type` also
    /// satisfies, transitively (`!extends` declarations).
    pub fn inherited_types(&self, var_type: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![var_type];
        while let Some(t) = stack.pop() {
            if let Some(parents) = self.inheritance.get(t) {
                for p in parents {
                    if !out.contains(&p.as_str()) {
                        out.push(p.as_str());
                        stack.push(p);
                    }
                }
            }
        }
        out
    }

    pub fn callback(&self, name: &str) -> Option<CallbackFn> {
        self.callbacks.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_format_parses_width() {
        let f = VarFormat::parse("var%05d").unwrap();
        assert_eq!(f.format(7), "var00007");
        let f = VarFormat::parse("v%d").unwrap();
        assert_eq!(f.format(7), "v7");
        assert!(VarFormat::parse("novar").is_err());
    }

    #[test]
    fn cdf_splits_residual_evenly() {
        // Two explicit (0.3, 0.2), two implicit: residual 0.5 split as
        // 0.25 each; cumulative ends at 1.0.
        let g = GrammarStore::from_str(
            "<x> = <a>\n\
             <a p=0.3> = 1\n\
             <a p=0.2> = 2\n\
             <a> = 3\n\
             <a> = 4\n",
            GrammarOptions::default(),
        )
        .unwrap();
        let cdf = g.cdf_for("a").expect("cdf");
        assert_eq!(cdf.len(), 4);
        // Creators are sorted by rule text: "<a p=0.2> = 2", "<a p=0.3> = 1",
        // "<a> = 3", "<a> = 4".
        assert!((cdf[0] - 0.2).abs() < 1e-9);
        assert!((cdf[1] - 0.5).abs() < 1e-9);
        assert!((cdf[2] - 0.75).abs() < 1e-9);
        assert!((cdf[3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cdf_rescales_when_sum_exceeds_one() {
        let g = GrammarStore::from_str(
            "<x> = <a>\n\
             <a p=2.0> = 1\n\
             <a p=2.0> = 2\n",
            GrammarOptions::default(),
        )
        .unwrap();
        let cdf = g.cdf_for("a").expect("cdf");
        assert!((cdf[0] - 0.5).abs() < 1e-9);
        assert!((cdf[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn uniform_symbols_skip_cdf() {
        let g = GrammarStore::from_str(
            "<a> = 1\n<a> = 2\n",
            GrammarOptions::default(),
        )
        .unwrap();
        assert!(g.cdf_for("a").is_none());
    }

    #[test]
    fn extends_is_transitive() {
        let g = GrammarStore::from_str(
            "!extends HTMLDivElement HTMLElement\n\
             !extends HTMLElement Element\n\
             <a> = 1\n",
            GrammarOptions::default(),
        )
        .unwrap();
        let parents = g.inherited_types("HTMLDivElement");
        assert!(parents.contains(&"HTMLElement"));
        assert!(parents.contains(&"Element"));
    }
}
