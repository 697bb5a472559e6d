//! Built-in scalar types and the registered callback table.
//!
//! Built-ins bottom out the grammar: bounded random integers and floats
//! (optionally in a fixed binary encoding), characters, strings, hex
//! digits, and a small set of constant characters that are awkward to
//! spell inside rule files.
//!
//! Callbacks are a closed capability set: a grammar may reference a
//! function by name via `<call function=name>`, but the function itself is
//! a plain Rust `fn` registered on the store before parsing. Grammar files
//! never carry executable code.

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::GenError;
use crate::grammar::rules::Tag;

/// A registered pure callback, invoked by `<call function=name>` parts.
pub type CallbackFn = fn(&Tag) -> String;

/// Integer built-in bounds, matching the usual fixed-width ranges.
fn int_range(name: &str) -> Option<(i128, i128)> {
    Some(match name {
        "int" | "int32" => (i32::MIN as i128, i32::MAX as i128),
        "uint32" => (0, u32::MAX as i128),
        "int8" => (i8::MIN as i128, i8::MAX as i128),
        "uint8" => (0, u8::MAX as i128),
        "int16" => (i16::MIN as i128, i16::MAX as i128),
        "uint16" => (0, u16::MAX as i128 + 1),
        "int64" => (i64::MIN as i128, i64::MAX as i128),
        "uint64" => (0, u64::MAX as i128),
        _ => return None,
    })
}

/// Width in bytes of an integer built-in's binary encoding.
fn int_width(name: &str) -> usize {
    match name {
        "int8" | "uint8" => 1,
        "int16" | "uint16" => 2,
        "int64" | "uint64" => 8,
        _ => 4,
    }
}

/// Constant single-character tags.
pub fn constant(name: &str) -> Option<&'static str> {
    Some(match name {
        "lt" => "<",
        "gt" => ">",
        "hash" => "#",
        "cr" => "\r",
        "lf" => "\n",
        "space" => " ",
        "tab" => "\t",
        "ex" => "!",
        _ => return None,
    })
}

/// Scalar built-in tag names (excluding constants and the structural
/// `import`/`lines` tags, which the generator handles itself).
pub fn is_scalar(name: &str) -> bool {
    matches!(
        name,
        "int"
            | "int8"
            | "int16"
            | "int32"
            | "int64"
            | "uint8"
            | "uint16"
            | "uint32"
            | "uint64"
            | "float"
            | "double"
            | "char"
            | "string"
            | "htmlsafestring"
            | "hex"
    )
}

/// True for any tag name the grammar treats as terminal: scalar built-ins,
/// constants, and the structural `import`/`lines` tags.
pub fn is_builtin_or_constant(name: &str) -> bool {
    is_scalar(name) || constant(name).is_some() || name == "import" || name == "lines"
}

/// Types never tracked as live variables.
pub fn is_noninteresting(name: &str) -> bool {
    matches!(
        name,
        "short" | "long" | "DOMString" | "boolean" | "float" | "double"
    )
}

fn parse_int(s: &str) -> Option<i128> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Raw bytes rendered as chars U+0000..=U+00FF, so fixed binary encodings
/// survive inside an output `String`.
fn bytes_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn generate_int(tag: &Tag, rng: &mut StdRng) -> Result<String, GenError> {
    let (def_min, def_max) = int_range(&tag.name).ok_or_else(|| GenError::Range {
        tag: tag.name.clone(),
    })?;
    let min = tag.attr("min").and_then(parse_int).unwrap_or(def_min);
    let max = tag.attr("max").and_then(parse_int).unwrap_or(def_max);
    if min > max {
        return Err(GenError::Range {
            tag: tag.name.clone(),
        });
    }
    let value = rng.gen_range(min..=max);
    if tag.has("b") || tag.has("be") {
        let width = int_width(&tag.name);
        let bytes = if tag.has("be") {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        // i128 buffer: little-endian takes the low bytes, big-endian the
        // high ones.
        let encoded = if tag.has("be") {
            &bytes[16 - width..]
        } else {
            &bytes[..width]
        };
        Ok(bytes_to_string(encoded))
    } else {
        Ok(value.to_string())
    }
}

fn generate_float(tag: &Tag, rng: &mut StdRng) -> Result<String, GenError> {
    let min: f64 = tag.attr("min").and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let max: f64 = tag.attr("max").and_then(|s| s.parse().ok()).unwrap_or(1.0);
    if min > max {
        return Err(GenError::Range {
            tag: tag.name.clone(),
        });
    }
    let value = min + rng.gen::<f64>() * (max - min);
    if tag.has("b") {
        if tag.name == "float" {
            Ok(bytes_to_string(&(value as f32).to_le_bytes()))
        } else {
            Ok(bytes_to_string(&value.to_le_bytes()))
        }
    } else {
        Ok(value.to_string())
    }
}

fn generate_char(tag: &Tag, rng: &mut StdRng) -> Result<String, GenError> {
    if let Some(code) = tag.attr("code").and_then(parse_int) {
        let c = char::from_u32(code as u32).ok_or_else(|| GenError::Range {
            tag: tag.name.clone(),
        })?;
        return Ok(c.to_string());
    }
    let min = tag.attr("min").and_then(parse_int).unwrap_or(0);
    let max = tag.attr("max").and_then(parse_int).unwrap_or(255);
    if min > max {
        return Err(GenError::Range {
            tag: tag.name.clone(),
        });
    }
    let code = rng.gen_range(min..=max) as u32;
    Ok(char::from_u32(code).unwrap_or('\u{fffd}').to_string())
}

fn generate_string(tag: &Tag, rng: &mut StdRng) -> Result<String, GenError> {
    let min = tag.attr("min").and_then(parse_int).unwrap_or(0).max(0) as u32;
    let max = tag.attr("max").and_then(parse_int).unwrap_or(255).max(0) as u32;
    if min > max {
        return Err(GenError::Range {
            tag: tag.name.clone(),
        });
    }
    let min_len = tag.attr("minlength").and_then(parse_int).unwrap_or(0) as usize;
    let max_len = tag.attr("maxlength").and_then(parse_int).unwrap_or(20) as usize;
    if min_len > max_len {
        return Err(GenError::Range {
            tag: tag.name.clone(),
        });
    }
    let len = rng.gen_range(min_len..=max_len);
    let mut out = String::with_capacity(len);
    let mut draws = 0usize;
    while out.chars().count() < len {
        draws += 1;
        if draws > len * 100 + 100 {
            // The charset yields (almost) nothing but skipped characters.
            return Err(GenError::Range {
                tag: tag.name.clone(),
            });
        }
        let code = rng.gen_range(min..=max);
        match char::from_u32(code) {
            // Quotes would break out of string literals in generated code.
            Some('"') | Some('\'') | None => continue,
            Some(c) => out.push(c),
        }
    }
    Ok(out)
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn generate_hex(tag: &Tag, rng: &mut StdRng) -> String {
    let digit = rng.gen_range(0..16u32);
    if tag.has("up") {
        format!("{digit:X}")
    } else {
        format!("{digit:x}")
    }
}

/// Expand a scalar built-in tag. Callers must have checked
/// [`is_scalar`] first.
pub fn generate_scalar(tag: &Tag, rng: &mut StdRng) -> Result<String, GenError> {
    match tag.name.as_str() {
        "int" | "int8" | "int16" | "int32" | "int64" | "uint8" | "uint16" | "uint32"
        | "uint64" => generate_int(tag, rng),
        "float" | "double" => generate_float(tag, rng),
        "char" => generate_char(tag, rng),
        "string" => generate_string(tag, rng),
        "htmlsafestring" => Ok(escape_html(&generate_string(tag, rng)?)),
        "hex" => Ok(generate_hex(tag, rng)),
        other => Err(GenError::Range { tag: other.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use rand::SeedableRng;

    fn tag_with(name: &str, attrs: &[(&str, &str)]) -> Tag {
        let mut map = IndexMap::new();
        for (k, v) in attrs {
            map.insert((*k).into(), (*v).into());
        }
        Tag {
            name: name.into(),
            creates_new: false,
            attrs: map,
        }
    }

    #[test]
    fn int_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let tag = tag_with("int", &[("min", "3"), ("max", "5")]);
        for _ in 0..64 {
            let v: i64 = generate_scalar(&tag, &mut rng).unwrap().parse().unwrap();
            assert!((3..=5).contains(&v));
        }
    }

    #[test]
    fn int_inverted_bounds_error() {
        let mut rng = StdRng::seed_from_u64(7);
        let tag = tag_with("int", &[("min", "9"), ("max", "1")]);
        assert!(generate_scalar(&tag, &mut rng).is_err());
    }

    #[test]
    fn binary_int_has_fixed_width() {
        let mut rng = StdRng::seed_from_u64(7);
        let tag = tag_with("uint16", &[("b", "")]);
        let s = generate_scalar(&tag, &mut rng).unwrap();
        assert_eq!(s.chars().count(), 2);
    }

    #[test]
    fn string_excludes_quotes() {
        let mut rng = StdRng::seed_from_u64(7);
        let tag = tag_with(
            "string",
            &[("min", "32"), ("max", "126"), ("minlength", "50"), ("maxlength", "50")],
        );
        let s = generate_scalar(&tag, &mut rng).unwrap();
        assert_eq!(s.chars().count(), 50);
        assert!(!s.contains('"') && !s.contains('\''));
    }

    #[test]
    fn all_quote_charset_errors_out() {
        let mut rng = StdRng::seed_from_u64(7);
        // Code point 34 is the double quote, the only candidate here.
        let tag = tag_with(
            "string",
            &[("min", "34"), ("max", "34"), ("minlength", "1"), ("maxlength", "1")],
        );
        assert!(generate_scalar(&tag, &mut rng).is_err());
    }

    #[test]
    fn htmlsafestring_is_escaped() {
        assert_eq!(escape_html("<a href=\"x\">"), "&lt;a href=&quot;x&quot;&gt;");
    }

    #[test]
    fn char_code_attr_is_exact() {
        let mut rng = StdRng::seed_from_u64(7);
        let tag = tag_with("char", &[("code", "0x41")]);
        assert_eq!(generate_scalar(&tag, &mut rng).unwrap(), "A");
    }
}
