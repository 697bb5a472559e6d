//! Full test-case assembly: style, markup and script blocks woven into an
//! output document template.
//!
//! The template carries three placeholders. `<cssfuzzer>` is replaced by
//! one style-rule expansion, `<htmlfuzzer>` by a batch of markup lines
//! (each element gets an injected `id` so the script side can reach it),
//! and every `<jsfuzzer>` by a generated function body. The first script
//! body is the main program, later ones are event handlers and get fewer
//! lines.

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::artifact::StmtRef;
use crate::error::GenError;
use crate::gen::{GeneratedBlock, Generator, Variable};
use crate::tree::DerivationTree;

pub const CSS_PLACEHOLDER: &str = "<cssfuzzer>";
pub const HTML_PLACEHOLDER: &str = "<htmlfuzzer>";
pub const JS_PLACEHOLDER: &str = "<jsfuzzer>";

/// Line budgets and batch sizes for one document.
#[derive(Debug, Clone)]
pub struct DocumentSpec {
    pub main_lines: usize,
    pub handler_lines: usize,
    pub html_lines: usize,
    /// Extra elements created from script, beyond those in the markup.
    pub extra_element_vars: usize,
    /// Symbol expanded from the style grammar.
    pub css_symbol: String,
}

impl Default for DocumentSpec {
    fn default() -> Self {
        DocumentSpec {
            main_lines: 1000,
            handler_lines: 500,
            html_lines: 10,
            extra_element_vars: 5,
            css_symbol: "rules".to_string(),
        }
    }
}

/// One assembled test case plus everything needed to map feedback back to
/// generation decisions.
#[derive(Debug)]
pub struct Document {
    pub text: String,
    pub trees: Vec<DerivationTree>,
    pub statements: FxHashMap<String, StmtRef>,
}

/// Markup element names with the script-side interface type they produce.
static HTML_TYPES: &[(&str, &str)] = &[
    ("a", "HTMLAnchorElement"),
    ("audio", "HTMLAudioElement"),
    ("body", "HTMLBodyElement"),
    ("br", "HTMLBRElement"),
    ("button", "HTMLButtonElement"),
    ("canvas", "HTMLCanvasElement"),
    ("caption", "HTMLTableCaptionElement"),
    ("col", "HTMLTableColElement"),
    ("datalist", "HTMLDataListElement"),
    ("details", "HTMLDetailsElement"),
    ("dialog", "HTMLDialogElement"),
    ("div", "HTMLDivElement"),
    ("dl", "HTMLDListElement"),
    ("embed", "HTMLEmbedElement"),
    ("fieldset", "HTMLFieldSetElement"),
    ("form", "HTMLFormElement"),
    ("h1", "HTMLHeadingElement"),
    ("h2", "HTMLHeadingElement"),
    ("hr", "HTMLHRElement"),
    ("iframe", "HTMLIFrameElement"),
    ("img", "HTMLImageElement"),
    ("input", "HTMLInputElement"),
    ("label", "HTMLLabelElement"),
    ("legend", "HTMLLegendElement"),
    ("li", "HTMLLIElement"),
    ("map", "HTMLMapElement"),
    ("marquee", "HTMLMarqueeElement"),
    ("meter", "HTMLMeterElement"),
    ("object", "HTMLObjectElement"),
    ("ol", "HTMLOListElement"),
    ("optgroup", "HTMLOptGroupElement"),
    ("option", "HTMLOptionElement"),
    ("output", "HTMLOutputElement"),
    ("p", "HTMLParagraphElement"),
    ("pre", "HTMLPreElement"),
    ("progress", "HTMLProgressElement"),
    ("q", "HTMLQuoteElement"),
    ("select", "HTMLSelectElement"),
    ("source", "HTMLSourceElement"),
    ("span", "HTMLSpanElement"),
    ("style", "HTMLStyleElement"),
    ("table", "HTMLTableElement"),
    ("tbody", "HTMLTableSectionElement"),
    ("td", "HTMLTableCellElement"),
    ("template", "HTMLTemplateElement"),
    ("textarea", "HTMLTextAreaElement"),
    ("time", "HTMLTimeElement"),
    ("tr", "HTMLTableRowElement"),
    ("track", "HTMLTrackElement"),
    ("ul", "HTMLUListElement"),
    ("video", "HTMLVideoElement"),
];

static SVG_TYPES: &[(&str, &str)] = &[
    ("circle", "SVGCircleElement"),
    ("clipPath", "SVGClipPathElement"),
    ("defs", "SVGDefsElement"),
    ("ellipse", "SVGEllipseElement"),
    ("feBlend", "SVGFEBlendElement"),
    ("feColorMatrix", "SVGFEColorMatrixElement"),
    ("feGaussianBlur", "SVGFEGaussianBlurElement"),
    ("feTurbulence", "SVGFETurbulenceElement"),
    ("filter", "SVGFilterElement"),
    ("g", "SVGGElement"),
    ("image", "SVGImageElement"),
    ("line", "SVGLineElement"),
    ("linearGradient", "SVGLinearGradientElement"),
    ("marker", "SVGMarkerElement"),
    ("mask", "SVGMaskElement"),
    ("path", "SVGPathElement"),
    ("pattern", "SVGPatternElement"),
    ("polygon", "SVGPolygonElement"),
    ("polyline", "SVGPolylineElement"),
    ("radialGradient", "SVGRadialGradientElement"),
    ("rect", "SVGRectElement"),
    ("stop", "SVGStopElement"),
    ("svg", "SVGSVGElement"),
    ("text", "SVGTextElement"),
    ("tspan", "SVGTSpanElement"),
    ("use", "SVGUseElement"),
];

fn html_type(tag: &str) -> Option<&'static str> {
    HTML_TYPES
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, ty)| *ty)
}

fn svg_type(tag: &str) -> Option<&'static str> {
    SVG_TYPES
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, ty)| *ty)
}

/// Element variables harvested from the markup block, plus the script
/// prologue that binds each to a name.
#[derive(Debug, Default)]
struct ElementVars {
    vars: Vec<Variable>,
    html_ctr: u32,
    svg_ctr: u32,
    prologue: String,
}

impl ElementVars {
    fn fresh_html_name(&mut self) -> String {
        self.html_ctr += 1;
        format!("htmlvar{:05}", self.html_ctr)
    }

    fn fresh_svg_name(&mut self) -> String {
        self.svg_ctr += 1;
        format!("svgvar{:05}", self.svg_ctr)
    }
}

/// Walk markup text and give every known element an `id` attribute, so
/// the script prologue can look it up (falling back to creating one if
/// the parser dropped it).
fn inject_element_ids(markup: &str, vars: &mut ElementVars) -> String {
    let mut out = String::with_capacity(markup.len());
    let bytes = markup.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len()
                && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'-')
            {
                j += 1;
            }
            // Only `<name ` opens an element with attributes to extend.
            if j > start && j < bytes.len() && bytes[j] == b' ' {
                let tag = &markup[start..j];
                if let Some(ty) = html_type(tag) {
                    let name = vars.fresh_html_name();
                    vars.prologue.push_str(&format!(
                        "/* newvar{{{name}:{ty}}} */ var {name} = document.getElementById(\"{name}\"); \
                         if({name} == null) {{ {name} = document.createElement(\"{tag}\"); }}\n"
                    ));
                    vars.vars.push(Variable::new(&name, ty));
                    out.push_str(&markup[i..=j]);
                    out.push_str(&format!("id=\"{name}\" "));
                    i = j + 1;
                    continue;
                }
                if let Some(ty) = svg_type(tag) {
                    let name = vars.fresh_svg_name();
                    vars.prologue.push_str(&format!(
                        "/* newvar{{{name}:{ty}}} */ var {name} = document.getElementById(\"{name}\"); \
                         if({name} == null) {{ {name} = document.createElementNS(\
                         \"http://www.w3.org/2000/svg\", \"{tag}\"); }}\n"
                    ));
                    vars.vars.push(Variable::new(&name, ty));
                    out.push_str(&markup[i..=j]);
                    out.push_str(&format!("id=\"{name}\" "));
                    i = j + 1;
                    continue;
                }
            }
        }
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&markup[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xf0 => 4,
        b if b >= 0xe0 => 3,
        _ => 2,
    }
}

/// Create `n` additional elements directly from script, widening the set
/// of live element types beyond whatever the markup produced.
fn create_extra_elements(vars: &mut ElementVars, n: usize, rng: &mut StdRng) {
    for _ in 0..n {
        let (tag, ty) = HTML_TYPES[rng.gen_range(0..HTML_TYPES.len())];
        let name = vars.fresh_html_name();
        vars.prologue.push_str(&format!(
            "/* newvar{{{name}:{ty}}} */ var {name} = document.createElement(\"{tag}\"); //{ty}\n"
        ));
        vars.vars.push(Variable::new(&name, ty));
    }
}

/// Wrap a generated script block in the variable-table scaffolding the
/// feedback harness expects.
fn function_body(prologue: &str, code: &str) -> String {
    let mut body = String::new();
    body.push_str("var fuzzervars = {};\n\n");
    body.push_str("SetVariable(fuzzervars, window, 'Window');\n");
    body.push_str("SetVariable(fuzzervars, document, 'Document');\n");
    body.push_str("SetVariable(fuzzervars, document.body.firstChild, 'Element');\n\n");
    body.push_str("//beginjs\n");
    body.push_str(prologue);
    body.push_str(code);
    body.push_str("\n//endjs\n");
    body.push_str("var fuzzervars = {};\nfreememory()\n");
    body
}

const MAX_SYMBOL_RETRIES: usize = 10;

/// Expand one symbol, retrying abandoned attempts a few times before
/// giving up on the document.
fn expand_with_retries(gen: &mut Generator<'_>, symbol: &str) -> Result<String, GenError> {
    let mut last = None;
    for _ in 0..MAX_SYMBOL_RETRIES {
        match gen.generate_symbol(symbol) {
            Ok(text) => return Ok(text),
            Err(err) if err.is_retryable() => last = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(GenError::NoRoot))
}

/// Assemble one full test case from the three grammars.
pub fn generate_document(
    spec: &DocumentSpec,
    template: &str,
    css: &mut Generator<'_>,
    html: &mut Generator<'_>,
    js: &mut Generator<'_>,
) -> Result<Document, GenError> {
    let style = expand_with_retries(css, &spec.css_symbol)?;

    let mut markup = String::new();
    for _ in 0..spec.html_lines {
        markup.push_str(&expand_with_retries(html, crate::grammar::LINE_SYMBOL)?);
    }

    let mut vars = ElementVars::default();
    let markup = inject_element_ids(&markup, &mut vars);
    create_extra_elements(&mut vars, spec.extra_element_vars, js.rng_mut());

    let mut text = template.replace(CSS_PLACEHOLDER, &style);
    text = text.replace(HTML_PLACEHOLDER, &markup);

    let mut trees: Vec<DerivationTree> = Vec::new();
    let mut statements: FxHashMap<String, StmtRef> = FxHashMap::default();

    // First script body is the main program, the rest are event handlers.
    let mut first = true;
    while text.contains(JS_PLACEHOLDER) {
        let lines = if first {
            spec.main_lines
        } else {
            spec.handler_lines
        };
        first = false;

        let GeneratedBlock {
            text: code,
            trees: block_trees,
            statements: block_statements,
        } = js.generate_block(lines, &vars.vars)?;

        let offset = trees.len() as u32;
        trees.extend(block_trees);
        for (stmt, stmt_ref) in block_statements {
            statements.insert(
                stmt,
                StmtRef {
                    tree: stmt_ref.tree + offset,
                    node: stmt_ref.node,
                },
            );
        }

        let body = function_body(&vars.prologue, &code);
        text = text.replacen(JS_PLACEHOLDER, &body, 1);
    }

    debug!(
        trees = trees.len(),
        statements = statements.len(),
        "document assembled"
    );
    Ok(Document {
        text,
        trees,
        statements,
    })
}
