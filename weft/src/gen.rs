//! The generation engine: expands symbols into statements, recording a
//! derivation tree per output unit.
//!
//! Generation is sequential within one generator; all per-unit state lives
//! in a [`GenContext`] that is cloned before each attempt and only
//! committed on success, so an abandoned unit leaves no trace. Recursion
//! and resampling limits surface as [`GenError`] values: the immediate
//! caller retries a failed slot with nonrecursive creators, and if that
//! fails too the whole unit is thrown away and regenerated.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::artifact::StmtRef;
use crate::driver::VALID_LABEL;
use crate::error::GenError;
use crate::grammar::{builtins, GrammarStore, RuleKind, RulePart, Tag, LINE_SYMBOL};
use crate::model::CHAIN_DEPTH;
use crate::selector::{Selector, SlotContext};
use crate::tree::{DerivationTree, NodeId, NodeKind};

/// Probability of biasing a line choice toward productions that touch a
/// type with at least one live variable.
const INTERESTING_LINE_PROB: f64 = 0.5;
/// Once this many live variables of one type exist, reuse is forced.
const MAX_VARS_OF_SAME_TYPE: usize = 5;
/// Consecutive abandoned units before giving up on a block.
const MAX_UNIT_RETRIES: usize = 1000;
/// Bound on retries for `<lines>` sub-blocks.
const MAX_SUBLINE_RETRIES: usize = 100;

/// A live variable available for reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub var_type: String,
}

impl Variable {
    pub fn new(name: &str, var_type: &str) -> Self {
        Variable {
            name: name.to_string(),
            var_type: var_type.to_string(),
        }
    }
}

/// Ephemeral per-unit generation state. Cloned before each unit attempt;
/// the clone replaces the original only if the attempt succeeds.
#[derive(Debug, Clone, Default)]
struct GenContext {
    last_var: u32,
    lines: Vec<String>,
    /// type -> live variable names of that type.
    variables: FxHashMap<String, Vec<String>>,
    /// Indices into the `line` creator list touching a live-variable type.
    interesting_lines: Vec<usize>,
    force_var_reuse: bool,
}

/// Result of one [`Generator::generate_block`] call.
#[derive(Debug)]
pub struct GeneratedBlock {
    /// Finalized output text, one statement per line.
    pub text: String,
    /// One tree per accepted unit, in emission order.
    pub trees: Vec<DerivationTree>,
    /// Exact emitted statement text (after line guarding, before the
    /// feedback harness) back to its generating node.
    pub statements: FxHashMap<String, StmtRef>,
}

pub struct Generator<'a> {
    store: &'a GrammarStore,
    selector: &'a Selector,
    rng: StdRng,
}

impl<'a> Generator<'a> {
    pub fn new(store: &'a GrammarStore, selector: &'a Selector, seed: u64) -> Self {
        Generator {
            store,
            selector,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Expand one symbol in a throwaway context. Used for non-code
    /// grammars (markup, style rules) where no variables or feedback are
    /// in play.
    pub fn generate_symbol(&mut self, symbol: &str) -> Result<String, GenError> {
        let mut ctx = GenContext::default();
        let mut tree = DerivationTree::new();
        let mut pending = Vec::new();
        self.expand_symbol(
            self.store,
            symbol,
            &mut ctx,
            &mut tree,
            (DerivationTree::ROOT, 0),
            0,
            false,
            &mut pending,
        )
    }

    /// Expand the grammar's declared root symbol.
    pub fn generate_root(&mut self) -> Result<String, GenError> {
        let root = self.store.root().ok_or(GenError::NoRoot)?.to_string();
        self.generate_symbol(&root)
    }

    /// Generate `n` output units. Each unit is one top-level `line`
    /// expansion plus any nested statements it spawned; abandoned attempts
    /// are retried, so a returned block always carries exactly `n` trees.
    pub fn generate_block(
        &mut self,
        n: usize,
        initial_vars: &[Variable],
    ) -> Result<GeneratedBlock, GenError> {
        let mut ctx = GenContext::default();
        for v in initial_vars {
            self.add_variable(self.store, &mut ctx, &v.name, &v.var_type);
        }
        self.add_variable(self.store, &mut ctx, "document", "Document");
        self.add_variable(self.store, &mut ctx, "window", "Window");

        let mut trees: Vec<DerivationTree> = Vec::new();
        let mut statements: FxHashMap<String, StmtRef> = FxHashMap::default();
        let mut consecutive_failures = 0usize;

        while trees.len() < n {
            let mut attempt = ctx.clone();
            let mut tree = DerivationTree::new();
            let mut pending: Vec<(String, NodeId)> = Vec::new();

            match self.expand_line(&mut attempt, &mut tree, &mut pending) {
                Ok(()) => {
                    consecutive_failures = 0;
                    ctx = attempt;
                    let tree_idx = trees.len() as u32;
                    for (text, node) in pending {
                        // Colliding identical text overwrites: last wins.
                        statements.insert(
                            apply_guard(self.store, &text),
                            StmtRef {
                                tree: tree_idx,
                                node,
                            },
                        );
                    }
                    trees.push(tree);
                }
                Err(err) if err.is_retryable() => {
                    consecutive_failures += 1;
                    debug!(%err, "abandoning output unit");
                    if consecutive_failures >= MAX_UNIT_RETRIES {
                        warn!(%err, retries = consecutive_failures, "giving up on block");
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let text = ctx
            .lines
            .iter()
            .map(|line| finalize_line(self.store, line))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(GeneratedBlock {
            text,
            trees,
            statements,
        })
    }

    /// One top-level unit: pick a `line` creator (biased toward lines that
    /// exercise live variables) and expand it at the tree root.
    fn expand_line(
        &mut self,
        ctx: &mut GenContext,
        tree: &mut DerivationTree,
        pending: &mut Vec<(String, NodeId)>,
    ) -> Result<(), GenError> {
        let creators = self
            .store
            .creators_for(LINE_SYMBOL)
            .ok_or_else(|| GenError::NoCreators {
                symbol: LINE_SYMBOL.to_string(),
            })?;

        let rule_idx =
            if self.rng.gen::<f64>() < INTERESTING_LINE_PROB && !ctx.interesting_lines.is_empty() {
                ctx.force_var_reuse = true;
                let pick = ctx.interesting_lines[self.rng.gen_range(0..ctx.interesting_lines.len())];
                creators[pick]
            } else {
                creators[self.rng.gen_range(0..creators.len())]
            };

        self.expand_rule(
            self.store,
            rule_idx,
            LINE_SYMBOL,
            ctx,
            tree,
            (DerivationTree::ROOT, 0),
            0,
            false,
            pending,
        )?;
        Ok(())
    }

    /// Expand `symbol` into the given tree slot: variable reuse, then
    /// oracle-guided rule selection, then rule expansion.
    #[allow(clippy::too_many_arguments)]
    fn expand_symbol(
        &mut self,
        store: &GrammarStore,
        symbol: &str,
        ctx: &mut GenContext,
        tree: &mut DerivationTree,
        slot: (NodeId, u32),
        depth: usize,
        force_nonrecursive: bool,
        pending: &mut Vec<(String, NodeId)>,
    ) -> Result<String, GenError> {
        if !builtins::is_noninteresting(symbol) {
            if let Some(vars) = ctx.variables.get(symbol) {
                if !vars.is_empty()
                    && (ctx.force_var_reuse
                        || vars.len() > MAX_VARS_OF_SAME_TYPE
                        || self.rng.gen::<f64>() < store.var_reuse_prob())
                {
                    ctx.force_var_reuse = false;
                    let name = vars[self.rng.gen_range(0..vars.len())].clone();
                    tree.add_phantom(slot.0, slot.1, &name, symbol);
                    return Ok(name);
                }
            }
        }

        if depth >= store.max_recursion() {
            return Err(GenError::RecursionLimit {
                symbol: symbol.to_string(),
                depth,
            });
        }

        let (parent_rule, chain_owned) = slot_lineage(tree, slot.0);
        let chain: Vec<&str> = chain_owned.iter().map(String::as_str).collect();
        let slot_ctx = SlotContext {
            symbol,
            parent_rule: parent_rule.as_deref(),
            slot: slot.1,
            chain: &chain,
            force_nonrecursive,
        };
        let rule_idx = self.selector.select(store, &slot_ctx, &mut self.rng)?;
        self.expand_rule(
            store,
            rule_idx,
            symbol,
            ctx,
            tree,
            slot,
            depth,
            force_nonrecursive,
            pending,
        )
    }

    /// Walk a rule's parts left to right, filling tree slots as
    /// nonterminals resolve. Code rules append their filled text to the
    /// context's line list and evaluate to a fresh variable name.
    #[allow(clippy::too_many_arguments)]
    fn expand_rule(
        &mut self,
        store: &GrammarStore,
        rule_idx: usize,
        symbol: &str,
        ctx: &mut GenContext,
        tree: &mut DerivationTree,
        slot: (NodeId, u32),
        depth: usize,
        force_nonrecursive: bool,
        pending: &mut Vec<(String, NodeId)>,
    ) -> Result<String, GenError> {
        let rule = store.rule(rule_idx);
        let node = tree.add_rule_node(slot.0, slot.1, &rule.text, rule.slot_count());

        let mut filled = String::new();
        let mut repeats: FxHashMap<&str, String> = FxHashMap::default();
        let mut new_vars: Vec<Variable> = Vec::new();
        let mut ret_vars: Vec<String> = Vec::new();
        let mut slot_cursor: u32 = 0;

        for part in &rule.parts {
            let tag = match part {
                RulePart::Text(text) => {
                    filled.push_str(text);
                    continue;
                }
                RulePart::Tag(tag) => tag,
            };
            if let Some(id) = tag.repeat_id() {
                if let Some(prev) = repeats.get(id) {
                    filled.push_str(prev);
                    continue;
                }
            }

            let expanded = if rule.kind == RuleKind::Code && tag.creates_new {
                ctx.last_var += 1;
                let name = store.var_format().format(ctx.last_var);
                new_vars.push(Variable::new(&name, &tag.name));
                if tag.name == symbol {
                    ret_vars.push(name.clone());
                }
                format!("/* newvar{{{name}:{}}} */ var {name}", tag.name)
            } else if let Some(constant) = builtins::constant(&tag.name) {
                constant.to_string()
            } else if tag.name == "import" {
                self.expand_import(store, tag)?
            } else if tag.name == "lines" {
                self.expand_lines(store, tag, ctx)?
            } else if tag.name == "call" {
                let callback = tag
                    .attr("function")
                    .and_then(|name| store.callback(name))
                    .ok_or_else(|| GenError::UnknownFunction {
                        name: tag.attr("function").unwrap_or("").to_string(),
                    })?;
                callback(tag)
            } else if builtins::is_scalar(&tag.name) {
                builtins::generate_scalar(tag, &mut self.rng)?
            } else {
                let here = slot_cursor;
                slot_cursor += 1;
                match self.expand_symbol(
                    store,
                    &tag.name,
                    ctx,
                    tree,
                    (node, here),
                    depth + 1,
                    force_nonrecursive,
                    pending,
                ) {
                    Ok(text) => text,
                    Err(err) if err.is_retryable() && !force_nonrecursive => {
                        // Retry this slot with nonrecursive creators only.
                        tree.clear_slot(node, here);
                        self.expand_symbol(
                            store,
                            &tag.name,
                            ctx,
                            tree,
                            (node, here),
                            depth + 1,
                            true,
                            pending,
                        )?
                    }
                    Err(err) => return Err(err),
                }
            };

            if let Some(id) = tag.repeat_id() {
                repeats.insert(id, expanded.clone());
            }
            filled.push_str(&expanded);
        }

        // Fresh variables become live and get a fallback fetch line, so a
        // statement that threw before assigning still leaves the name
        // usable.
        let mut additional_lines = Vec::new();
        for v in &new_vars {
            if builtins::is_noninteresting(&v.var_type) {
                continue;
            }
            self.add_variable(store, ctx, &v.name, &v.var_type);
            additional_lines.push(format!(
                "if (!{name}) {{ {name} = GetVariable(fuzzervars, '{ty}'); }} else {{ {setters}}}",
                name = v.name,
                ty = v.var_type,
                setters = variable_setters(store, &v.name, &v.var_type),
            ));
        }

        match rule.kind {
            RuleKind::Grammar => Ok(filled),
            RuleKind::Code => {
                ctx.lines.push(filled.clone());
                pending.push((filled.clone(), node));
                ctx.lines.extend(additional_lines);
                if symbol == LINE_SYMBOL {
                    Ok(filled)
                } else if ret_vars.is_empty() {
                    Err(GenError::NoFreshVariable {
                        symbol: symbol.to_string(),
                    })
                } else {
                    Ok(ret_vars[self.rng.gen_range(0..ret_vars.len())].clone())
                }
            }
        }
    }

    /// `<import from=... symbol=...>`: expand a symbol from a sub-grammar
    /// in a fresh context and a throwaway tree.
    fn expand_import(&mut self, store: &GrammarStore, tag: &Tag) -> Result<String, GenError> {
        let name = tag.attr("from").ok_or_else(|| GenError::UnknownImport {
            name: String::new(),
        })?;
        let sub = store.import(name).ok_or_else(|| GenError::UnknownImport {
            name: name.to_string(),
        })?;
        let symbol = match tag.attr("symbol") {
            Some(symbol) => symbol.to_string(),
            None => sub.root().ok_or(GenError::NoRoot)?.to_string(),
        };
        let mut ctx = GenContext::default();
        let mut tree = DerivationTree::new();
        let mut pending = Vec::new();
        self.expand_symbol(
            sub,
            &symbol,
            &mut ctx,
            &mut tree,
            (DerivationTree::ROOT, 0),
            0,
            false,
            &mut pending,
        )
    }

    /// `<lines count=N>`: a nested block of N statements, emitted inline
    /// (e.g. a generated function body). Shares the variable counter with
    /// the outer context so names stay unique, but variables declared
    /// inside are scoped to the sub-block.
    fn expand_lines(
        &mut self,
        store: &GrammarStore,
        tag: &Tag,
        ctx: &mut GenContext,
    ) -> Result<String, GenError> {
        let count: usize = tag
            .attr("count")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GenError::Range {
                tag: "lines".to_string(),
            })?;

        let mut sub = GenContext {
            last_var: ctx.last_var,
            ..Default::default()
        };
        self.add_variable(store, &mut sub, "document", "Document");
        self.add_variable(store, &mut sub, "window", "Window");

        let mut retries = 0usize;
        let mut units = 0usize;
        while units < count {
            let mut attempt = sub.clone();
            let mut tree = DerivationTree::new();
            let mut pending = Vec::new();
            match self.expand_line(&mut attempt, &mut tree, &mut pending) {
                Ok(()) => {
                    sub = attempt;
                    units += 1;
                }
                Err(err) if err.is_retryable() => {
                    retries += 1;
                    if retries >= MAX_SUBLINE_RETRIES {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        ctx.last_var = sub.last_var;
        Ok(sub
            .lines
            .iter()
            .map(|line| finalize_line(store, line))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Register a live variable under its type and every inherited type,
    /// unlocking the interesting lines that touch those types.
    fn add_variable(&mut self, store: &GrammarStore, ctx: &mut GenContext, name: &str, var_type: &str) {
        let mut types = vec![var_type];
        types.extend(store.inherited_types(var_type));
        for ty in types {
            if !ctx.variables.contains_key(ty) {
                if let Some(lines) = store.interesting_lines_for(ty) {
                    for &i in lines {
                        if !ctx.interesting_lines.contains(&i) {
                            ctx.interesting_lines.push(i);
                        }
                    }
                }
            }
            ctx.variables
                .entry(ty.to_string())
                .or_default()
                .push(name.to_string());
        }
    }
}

/// The (parent rule, ancestor chain) pair describing one slot's lineage.
/// Chain is nearest first, capped at the model depth, root excluded.
fn slot_lineage(tree: &DerivationTree, parent: NodeId) -> (Option<String>, Vec<String>) {
    match &tree.node(parent).kind {
        NodeKind::Rule { rule } => {
            let mut chain = vec![rule.clone()];
            chain.extend(
                tree.ancestor_chain(parent, CHAIN_DEPTH - 1)
                    .into_iter()
                    .map(str::to_string),
            );
            (Some(rule.clone()), chain)
        }
        _ => (None, Vec::new()),
    }
}

/// `SetVariable` calls registering a name under its type and all
/// inherited types.
fn variable_setters(store: &GrammarStore, name: &str, var_type: &str) -> String {
    let mut out = format!("SetVariable(fuzzervars, {name}, '{var_type}'); ");
    for parent in store.inherited_types(var_type) {
        out.push_str(&format!("SetVariable(fuzzervars, {name}, '{parent}'); "));
    }
    out
}

/// Apply the grammar's `!lineguard` wrapper, if any.
pub(crate) fn apply_guard(store: &GrammarStore, line: &str) -> String {
    match store.line_guard() {
        Some(guard) => guard.replace("<line>", line),
        None => line.to_string(),
    }
}

/// Guard a line and, for script output, wrap it in the try/catch feedback
/// harness reporting per-statement outcomes.
pub(crate) fn finalize_line(store: &GrammarStore, line: &str) -> String {
    let guarded = apply_guard(store, line);
    if store.options().script_harness {
        format!(
            "try {{ {guarded};  UpdateFeedback(String.raw`{guarded}`, \"{VALID_LABEL}\"); }} \
             catch(e) {{  UpdateFeedback(String.raw`{guarded}`, e.name) }}"
        )
    } else {
        guarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarOptions;

    fn js_options() -> GrammarOptions {
        GrammarOptions::default()
    }

    fn code_grammar(text: &str) -> GrammarStore {
        GrammarStore::from_str(text, js_options()).expect("grammar parses")
    }

    #[test]
    fn block_has_one_tree_per_unit() {
        let g = code_grammar(
            "!begin lines\n\
             <new Thing> = makeThing(<int min=0 max=9>);\n\
             !end lines\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 42);
        let block = gen.generate_block(4, &[]).unwrap();
        assert_eq!(block.trees.len(), 4);
        assert!(!block.statements.is_empty());
        for key in block.statements.keys() {
            assert!(block.text.contains(key.as_str()), "missing: {key}");
        }
    }

    #[test]
    fn recursive_grammar_terminates() {
        // Either rule can be drawn; the recursion limit plus unit retry
        // must always terminate regardless of seed.
        let g = code_grammar(
            "!max_recursion 3\n\
             !var_reuse_prob 0.0\n\
             !begin lines\n\
             <new A> = 1;\n\
             <new A> = <A> + 1;\n\
             !end lines\n",
        );
        let sel = Selector::default();
        for seed in 0..20 {
            let mut gen = Generator::new(&g, &sel, seed);
            let block = gen.generate_block(3, &[]).unwrap();
            assert_eq!(block.trees.len(), 3);
        }
    }

    #[test]
    fn forced_reuse_installs_phantom() {
        let g = code_grammar(
            "!var_reuse_prob 1.0\n\
             !begin lines\n\
             <new Node> = fresh();\n\
             use(<Node>);\n\
             !end lines\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 7);
        let block = gen.generate_block(20, &[]).unwrap();

        let phantom = block.trees.iter().any(|t| {
            t.node_ids()
                .any(|id| matches!(t.node(id).kind, NodeKind::Phantom { .. }))
        });
        assert!(phantom, "no variable reuse recorded in 20 units");
    }

    #[test]
    fn fresh_variable_gets_fallback_line() {
        let g = code_grammar(
            "!begin lines\n\
             <new Widget> = build();\n\
             !end lines\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 1);
        let block = gen.generate_block(1, &[]).unwrap();
        assert!(block.text.contains("/* newvar{"));
        assert!(block.text.contains("GetVariable(fuzzervars, 'Widget')"));
        assert!(block.text.contains("SetVariable(fuzzervars,"));
    }

    #[test]
    fn lineguard_wraps_statements_and_keys() {
        let g = code_grammar(
            "!lineguard try { <line> } catch(e) {}\n\
             !begin lines\n\
             <new X> = go();\n\
             !end lines\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 1);
        let block = gen.generate_block(1, &[]).unwrap();
        assert!(block.text.starts_with("try {"));
        for key in block.statements.keys() {
            assert!(key.starts_with("try {"));
        }
    }

    #[test]
    fn harness_reports_per_statement_feedback() {
        let opts = GrammarOptions {
            script_harness: true,
            ..js_options()
        };
        let g = GrammarStore::from_str(
            "!begin lines\n<new X> = go();\n!end lines\n",
            opts,
        )
        .unwrap();
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 1);
        let block = gen.generate_block(1, &[]).unwrap();
        assert!(block.text.contains("UpdateFeedback(String.raw`"));
        assert!(block.text.contains("catch(e)"));
        // Statement keys carry the guarded text, not the harness.
        for key in block.statements.keys() {
            assert!(!key.contains("UpdateFeedback"));
        }
    }

    #[test]
    fn repeated_ids_reuse_first_expansion() {
        let g = code_grammar(
            "<pair> = <digit id=1>:<digit id=1>\n\
             <digit> = <int min=0 max=9>\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 5);
        for _ in 0..16 {
            let s = gen.generate_symbol("pair").unwrap();
            let (a, b) = s.split_once(':').unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let text = "!begin lines\n\
                    <new A> = f(<int>);\n\
                    <new B> = g(<A>, <string maxlength=5>);\n\
                    !end lines\n";
        let g1 = code_grammar(text);
        let g2 = code_grammar(text);
        let sel = Selector::default();
        let a = Generator::new(&g1, &sel, 99).generate_block(10, &[]).unwrap();
        let b = Generator::new(&g2, &sel, 99).generate_block(10, &[]).unwrap();
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn initial_variables_are_reusable() {
        let g = code_grammar(
            "!var_reuse_prob 1.0\n\
             !begin lines\n\
             poke(<Element>);\n\
             !end lines\n",
        );
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 3);
        let vars = [Variable::new("htmlvar00001", "Element")];
        let block = gen.generate_block(2, &vars).unwrap();
        assert!(block.text.contains("poke(htmlvar00001);"));
    }

    #[test]
    fn import_expands_sub_grammar_root() {
        // Imports resolve through the store's import table; a missing
        // entry is a hard error.
        let g = code_grammar("<a> = <import from=missing>\n");
        let sel = Selector::default();
        let mut gen = Generator::new(&g, &sel, 1);
        assert!(matches!(
            gen.generate_symbol("a"),
            Err(GenError::UnknownImport { .. })
        ));
    }
}
