//! Test-case generator binary: loads the three grammars, optionally an
//! invalid-context model, and writes generated pages to a directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft::document::DocumentSpec;
use weft::driver::{GrammarSet, Session};
use weft::grammar::{GrammarOptions, GrammarStore};
use weft::model::InvalidModel;
use weft::selector::Selector;

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Grammar-driven browser test-case generator")]
#[command(version)]
struct Cli {
    /// Style grammar file
    #[arg(long, value_name = "FILE")]
    css_grammar: PathBuf,

    /// Markup grammar file
    #[arg(long, value_name = "FILE")]
    html_grammar: PathBuf,

    /// Script grammar file
    #[arg(long, value_name = "FILE")]
    js_grammar: PathBuf,

    /// Page template containing the <cssfuzzer>, <htmlfuzzer> and
    /// <jsfuzzer> placeholders
    #[arg(long, value_name = "FILE")]
    template: PathBuf,

    /// Directory generated cases are written to
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Number of cases to generate
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Rule identity table from a training run
    #[arg(long, value_name = "FILE", requires = "invalid_tree")]
    rule_table: Option<PathBuf>,

    /// Invalid-context tree from a training run; with --rule-table this
    /// enables learned constraint pruning
    #[arg(long, value_name = "FILE", requires = "rule_table")]
    invalid_tree: Option<PathBuf>,

    /// Record derivation trees and dump a training artifact per case
    /// into DIR
    #[arg(long, value_name = "DIR")]
    collect_trees: Option<PathBuf>,

    /// Learn per-slot candidate weights from execution feedback
    /// submitted through the driver boundary
    #[arg(long)]
    online_weights: bool,

    /// Statements in the first script block
    #[arg(long, default_value_t = 1000)]
    main_lines: usize,

    /// Statements in each event-handler script block
    #[arg(long, default_value_t = 500)]
    handler_lines: usize,

    /// RNG seed; random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let invalid = match (&cli.rule_table, &cli.invalid_tree) {
        (Some(table), Some(tree)) => Some(
            InvalidModel::load(table, tree).context("failed to load invalid-context model")?,
        ),
        _ => None,
    };

    let grammars = load_grammars(&cli, invalid.is_some())?;
    let template = fs::read_to_string(&cli.template)
        .with_context(|| format!("failed to read template {}", cli.template.display()))?;

    fs::create_dir_all(&cli.out)
        .with_context(|| format!("failed to create {}", cli.out.display()))?;

    let seed = cli.seed.unwrap_or_else(rand::random);
    info!(seed, count = cli.count, "generating cases");

    let selector = Selector::new(cli.online_weights, invalid);
    let spec = DocumentSpec {
        main_lines: cli.main_lines,
        handler_lines: cli.handler_lines,
        ..Default::default()
    };
    let mut session = Session::new(grammars, template, selector, seed).with_spec(spec);
    if let Some(dir) = &cli.collect_trees {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        session = session.with_artifact_dir(dir.clone());
    }

    for i in 0..cli.count {
        let case = session
            .generate_case()
            .with_context(|| format!("failed to generate case {i}"))?;
        let path = cli.out.join(format!("case-{i:05}.html"));
        fs::write(&path, &case).with_context(|| format!("failed to write {}", path.display()))?;
        if cli.collect_trees.is_some() {
            session
                .flush_artifact()
                .context("failed to write training artifact")?;
        }
        info!(path = %path.display(), bytes = case.len(), "case written");
    }
    Ok(())
}

/// Load the three grammars and wire the style grammar into the other two
/// as `cssgrammar`, so markup and script rules can splice style fragments.
fn load_grammars(cli: &Cli, have_invalid_model: bool) -> Result<GrammarSet> {
    let css = load_one(&cli.css_grammar, GrammarOptions::default())?;

    let mut html = load_one(&cli.html_grammar, GrammarOptions::default())?;
    html.add_import("cssgrammar", css.clone());

    let js_options = GrammarOptions {
        script_harness: true,
        prune: true,
    };
    let mut js = load_one(&cli.js_grammar, js_options)?;
    js.add_import("cssgrammar", css.clone());
    if have_invalid_model {
        // Fresh variables give the invalid-model oracle more contexts to
        // steer; reuse less when it is active.
        js.set_invalid_tree_reuse_prob();
    }

    Ok(GrammarSet { css, html, js })
}

fn load_one(path: &Path, options: GrammarOptions) -> Result<GrammarStore> {
    GrammarStore::from_file(path, options)
        .with_context(|| format!("failed to load grammar {}", path.display()))
}
