//! Parser for the line-oriented rule-definition language.
//!
//! Directives are prefixed with `!`. A grammar rule looks like
//! `<Tag attrs> = parts...`; inside a `!begin lines` section every line is
//! a code rule (free text with `<new Type>` markers). `#` starts a
//! comment. Any malformed line is a hard error: grammar correctness is a
//! precondition for everything downstream.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::GrammarError;
use crate::grammar::rules::{Rule, RuleKind, RulePart, Tag};
use crate::grammar::{GrammarOptions, GrammarStore, VarFormat};

/// Parse `path` (plus anything it includes) into `store`.
pub(crate) fn parse_file(store: &mut GrammarStore, path: &Path) -> Result<(), GrammarError> {
    let text = fs::read_to_string(path).map_err(|source| GrammarError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    parse_str(store, &text, &base)
}

/// Parse grammar text; `base_dir` resolves `!include`/`!import` paths.
pub(crate) fn parse_str(
    store: &mut GrammarStore,
    text: &str,
    base_dir: &Path,
) -> Result<(), GrammarError> {
    let mut section = Section::Top;

    for raw_line in text.lines() {
        // Function bodies are kept verbatim (they are ignored anyway; the
        // name must match a registered callback).
        let clean = if matches!(section, Section::Function) {
            raw_line.to_string()
        } else {
            strip_comment(raw_line)
        };
        if clean.is_empty() && !matches!(section, Section::Function) {
            continue;
        }

        if let Some((command, params)) = parse_directive(&clean) {
            // Inside a function body only the terminator is a directive;
            // anything else starting with `!` is body text.
            if matches!(section, Section::Function) && (command, params) != ("end", "function") {
                continue;
            }
            section = handle_directive(store, base_dir, section, command, params)?;
            continue;
        }

        match section {
            Section::Top => parse_grammar_line(store, &clean)?,
            Section::Lines { helper } => parse_code_line(store, &clean, helper)?,
            Section::Function => {} // body ignored by design
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Section {
    Top,
    Lines { helper: bool },
    Function,
}

fn strip_comment(line: &str) -> String {
    match line.find('#') {
        Some(i) => line[..i].trim().to_string(),
        None => line.trim().to_string(),
    }
}

/// `!command params` at the start of a line.
fn parse_directive(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('!')?;
    let end = rest
        .find(|c: char| !(c.is_ascii_lowercase() || c == '_'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some((&rest[..end], rest[end..].trim()))
}

fn handle_directive(
    store: &mut GrammarStore,
    base_dir: &Path,
    section: Section,
    command: &str,
    params: &str,
) -> Result<Section, GrammarError> {
    match command {
        "varformat" => {
            store.var_format = VarFormat::parse(params)?;
            Ok(section)
        }
        "include" => {
            if store.included.insert(params.to_string()) {
                include_file(store, base_dir, params)?;
            }
            Ok(section)
        }
        "import" => {
            import_grammar(store, base_dir, params)?;
            Ok(section)
        }
        "lineguard" => {
            store.line_guard = Some(params.to_string());
            Ok(section)
        }
        "max_recursion" => {
            store.max_recursion =
                params
                    .parse()
                    .map_err(|_| GrammarError::DirectiveArgument {
                        directive: "max_recursion".into(),
                        message: format!("`{params}` is not an integer"),
                    })?;
            Ok(section)
        }
        "var_reuse_prob" => {
            store.var_reuse_prob =
                params
                    .parse()
                    .map_err(|_| GrammarError::DirectiveArgument {
                        directive: "var_reuse_prob".into(),
                        message: format!("`{params}` is not a number"),
                    })?;
            Ok(section)
        }
        "extends" => {
            let mut args = params.split_whitespace();
            let (Some(child), Some(parent)) = (args.next(), args.next()) else {
                return Err(GrammarError::DirectiveArgument {
                    directive: "extends".into(),
                    message: "expected `<child> <parent>`".into(),
                });
            };
            store
                .inheritance
                .entry(child.to_string())
                .or_default()
                .push(parent.to_string());
            Ok(section)
        }
        "begin" => match params {
            "lines" => Ok(Section::Lines { helper: false }),
            "helperlines" => Ok(Section::Lines { helper: true }),
            _ => {
                if let Some(name) = params.strip_prefix("function") {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(GrammarError::DirectiveArgument {
                            directive: "begin".into(),
                            message: "function directive without a name".into(),
                        });
                    }
                    if !store.callbacks.contains_key(name) {
                        return Err(GrammarError::UnknownFunction { name: name.into() });
                    }
                    Ok(Section::Function)
                } else {
                    Err(GrammarError::DirectiveArgument {
                        directive: "begin".into(),
                        message: format!("unknown section `{params}`"),
                    })
                }
            }
        },
        "end" => match params {
            "lines" | "helperlines" => Ok(Section::Top),
            "function" => Ok(Section::Top),
            _ => Err(GrammarError::DirectiveArgument {
                directive: "end".into(),
                message: format!("unknown section `{params}`"),
            }),
        },
        other => Err(GrammarError::UnknownDirective { name: other.into() }),
    }
}

fn include_file(store: &mut GrammarStore, base_dir: &Path, name: &str) -> Result<(), GrammarError> {
    let path: PathBuf = base_dir.join(name);
    parse_file(store, &path)
}

fn import_grammar(
    store: &mut GrammarStore,
    base_dir: &Path,
    name: &str,
) -> Result<(), GrammarError> {
    let path = base_dir.join(name);
    let sub = GrammarStore::from_file(&path, GrammarOptions::default())?;
    let basename = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    store.imports.insert(basename, sub);
    Ok(())
}

/// Split a rule's right-hand text into literal and tag parts.
///
/// A `<` opens a tag only if a `>` appears before any `)`; this keeps
/// comparison operators in code lines (`if (a < b)`) literal, same
/// heuristic as the original definition language.
fn split_parts(text: &str, line: &str) -> Result<Vec<RulePart>, GrammarError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let bytes: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '<' {
            let mut j = i + 1;
            let mut closing = None;
            while j < bytes.len() {
                match bytes[j] {
                    '>' => {
                        closing = Some(j);
                        break;
                    }
                    ')' => break,
                    _ => j += 1,
                }
            }
            if let Some(close) = closing {
                let content: String = bytes[i + 1..close].iter().collect();
                if !literal.is_empty() {
                    parts.push(RulePart::Text(std::mem::take(&mut literal)));
                }
                parts.push(RulePart::Tag(parse_tag(&content, line)?));
                i = close + 1;
                continue;
            }
        }
        literal.push(bytes[i]);
        i += 1;
    }
    if !literal.is_empty() {
        parts.push(RulePart::Text(literal));
    }
    Ok(parts)
}

/// Parse the inside of a `<...>` tag: name, optional `new` marker, and
/// `key=value` / flag attributes.
fn parse_tag(content: &str, line: &str) -> Result<Tag, GrammarError> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.is_empty() {
        return Err(GrammarError::EmptyTag { line: line.into() });
    }
    let (name, attr_start, creates_new) = if fields.len() > 1 && fields[0] == "new" {
        (fields[1], 2, true)
    } else {
        (fields[0], 1, false)
    };
    let mut tag = Tag {
        name: name.to_string(),
        creates_new,
        ..Default::default()
    };
    for field in &fields[attr_start..] {
        let kv: Vec<&str> = field.split('=').collect();
        match kv.as_slice() {
            [k, v] => {
                tag.attrs.insert((*k).to_string(), (*v).to_string());
            }
            [k] => {
                tag.attrs.insert((*k).to_string(), String::new());
            }
            _ => {
                return Err(GrammarError::Rule {
                    line: line.into(),
                    message: format!("error parsing tag `{content}`"),
                });
            }
        }
    }
    Ok(tag)
}

/// `<Tag attrs> = parts...`
fn parse_grammar_line(store: &mut GrammarStore, line: &str) -> Result<(), GrammarError> {
    let Some(rest) = line.strip_prefix('<') else {
        return Err(GrammarError::Rule {
            line: line.into(),
            message: "expected `<tag> = ...`".into(),
        });
    };
    let Some(close) = rest.find('>') else {
        return Err(GrammarError::Rule {
            line: line.into(),
            message: "unterminated tag".into(),
        });
    };
    let creates = parse_tag(&rest[..close], line)?;
    let after = rest[close + 1..].trim_start();
    let Some(rhs) = after.strip_prefix('=') else {
        return Err(GrammarError::Rule {
            line: line.into(),
            message: "expected `=` after tag".into(),
        });
    };
    let parts = split_parts(rhs.trim_start(), line)?;

    let recursive = parts.iter().any(|p| match p {
        RulePart::Tag(t) => !t.creates_new && t.name == creates.name,
        RulePart::Text(_) => false,
    });

    store.add_rule(Rule {
        kind: RuleKind::Grammar,
        text: line.to_string(),
        parts,
        creates: vec![creates],
        recursive,
        helper: false,
    });
    Ok(())
}

/// Free text with `<new Type>` markers; becomes one output statement.
fn parse_code_line(store: &mut GrammarStore, line: &str, helper: bool) -> Result<(), GrammarError> {
    let parts = split_parts(line, line)?;
    let creates: Vec<Tag> = parts
        .iter()
        .filter_map(|p| match p {
            RulePart::Tag(t) if t.creates_new => Some(t.clone()),
            _ => None,
        })
        .collect();
    let recursive = creates.iter().any(|created| {
        parts.iter().any(|p| match p {
            RulePart::Tag(t) => !t.creates_new && t.name == created.name,
            RulePart::Text(_) => false,
        })
    });

    store.add_rule(Rule {
        kind: RuleKind::Code,
        text: line.to_string(),
        parts,
        creates,
        recursive,
        helper,
    });
    Ok(())
}
