//! Pattern Validator & Summarizer (`SPEC_FULL.md` §4.1).
//!
//! Deterministic, non-evaluating structural check on a pattern-DSL string,
//! plus a compact summary used to describe a peer's current pattern inside
//! another agent's prompt. Delimiter balance-checking here follows the same
//! "scan and count, don't evaluate" spirit as `Agent::parse_tool_call`'s
//! brace-counting JSON extraction.

use std::collections::BTreeMap;

const OPEN_DELIMS: [char; 4] = ['[', '<', '{', '('];
const CLOSE_DELIMS: [char; 4] = [']', '>', '}', ')'];

/// Known mini-notation source methods (`SPEC_FULL.md` §4.1 "source ∈ {s, note}").
const KNOWN_SOURCES: [&str; 2] = ["s", "note"];

/// Chained method names treated as value-bearing effects rather than bare modifiers.
const EFFECT_METHODS: [&str; 8] = [
    "gain", "room", "lpf", "hpf", "speed", "pan", "shape", "delay",
];

const SILENCE: &str = "silence";
const NO_CHANGE: &str = "no_change";

/// Result of `validate`: either accepted, or rejected with a one-line reason.
pub type ValidationResult = Result<(), String>;

/// One extracted layer of a (possibly `stack(...)`ed) pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternLayer {
    pub source: Option<String>,
    pub tokens: Option<String>,
    pub effects: BTreeMap<String, String>,
    pub modifiers: Vec<String>,
}

/// Checks that `pattern` is well-formed enough to broadcast to the rendering
/// engine. `silence` and `no_change` are always accepted.
pub fn validate(pattern: &str) -> ValidationResult {
    let trimmed = pattern.trim();
    if trimmed == SILENCE || trimmed == NO_CHANGE {
        return Ok(());
    }
    if trimmed.is_empty() {
        return Err("pattern is empty".to_string());
    }

    check_balanced_delimiters(trimmed)?;
    check_method_chain_shape(trimmed)?;
    Ok(())
}

/// Stack-based delimiter matcher over the closed set `[] <> {} ()`, requiring
/// matching pairs in nesting order.
fn check_balanced_delimiters(s: &str) -> ValidationResult {
    let mut stack: Vec<char> = Vec::new();
    for (idx, ch) in s.char_indices() {
        if let Some(pos) = OPEN_DELIMS.iter().position(|c| *c == ch) {
            stack.push(CLOSE_DELIMS[pos]);
        } else if CLOSE_DELIMS.contains(&ch) {
            match stack.pop() {
                Some(expected) if expected == ch => {}
                Some(expected) => {
                    return Err(format!(
                        "mismatched delimiter at byte {}: expected '{}', found '{}'",
                        idx, expected, ch
                    ));
                }
                None => {
                    return Err(format!("unmatched closing delimiter '{}' at byte {}", ch, idx));
                }
            }
        }
    }
    if let Some(expected) = stack.pop() {
        return Err(format!("unclosed delimiter: expected '{}' before end of input", expected));
    }
    Ok(())
}

/// Loosely checks that the pattern is a single expression: an identifier
/// followed by a parenthesized call, optionally chained with further
/// `.identifier(...)` calls.
fn check_method_chain_shape(s: &str) -> ValidationResult {
    let bytes = s.as_bytes();
    let mut i = 0usize;

    // Leading identifier.
    let start = i;
    while i < bytes.len() && (bytes[i] as char).is_alphanumeric() || i < bytes.len() && bytes[i] == b'_' {
        i += 1;
    }
    if i == start {
        return Err("expected an identifier at the start of the expression".to_string());
    }

    loop {
        if i >= bytes.len() || bytes[i] != b'(' {
            return Err(format!("expected '(' after identifier at byte {}", i));
        }
        // Skip the balanced parenthesized argument list.
        let mut depth = 0i32;
        let open_at = i;
        while i < bytes.len() {
            match bytes[i] as char {
                c if OPEN_DELIMS.contains(&c) => depth += 1,
                c if CLOSE_DELIMS.contains(&c) => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return Err(format!("unterminated argument list starting at byte {}", open_at));
        }

        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            let method_start = i;
            while i < bytes.len() && ((bytes[i] as char).is_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if i == method_start {
                return Err(format!("expected method name after '.' at byte {}", i));
            }
            continue;
        }
        break;
    }

    if i != bytes.len() {
        return Err(format!("unexpected trailing content at byte {}", i));
    }
    Ok(())
}

/// Walks the (already-validated) pattern and extracts a compact human-readable
/// summary, or `None` for `silence`/`no_change`/unparseable input.
pub fn summarize(pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    if trimmed == SILENCE || trimmed == NO_CHANGE || trimmed.is_empty() {
        return None;
    }
    let layers = extract_layers(trimmed)?;
    if layers.is_empty() {
        return None;
    }

    let mut parts: Vec<String> = Vec::new();
    if layers.len() > 1 {
        parts.push(format!("{} layers", layers.len()));
    }
    for layer in &layers {
        let mut piece = String::new();
        if let Some(tokens) = &layer.tokens {
            piece.push_str(tokens);
        }
        if !layer.effects.is_empty() {
            let effects: Vec<String> = layer
                .effects
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            piece.push_str(&format!(" [{}]", effects.join(" ")));
        }
        if !layer.modifiers.is_empty() {
            piece.push_str(&format!(" ({})", layer.modifiers.join(", ")));
        }
        if !piece.is_empty() {
            parts.push(piece);
        }
    }
    Some(parts.join("; "))
}

/// Splits a pattern into its `stack(...)`-member layers (or a single layer if
/// not stacked) and parses each into source/tokens/effects/modifiers.
fn extract_layers(pattern: &str) -> Option<Vec<PatternLayer>> {
    if let Some(inner) = pattern.strip_prefix("stack(").and_then(|s| s.strip_suffix(')')) {
        let mut layers = Vec::new();
        for arg in split_top_level_args(inner) {
            layers.push(parse_layer(arg.trim())?);
        }
        Some(layers)
    } else {
        Some(vec![parse_layer(pattern)?])
    }
}

/// Splits a comma-separated argument list at top-level nesting only.
fn split_top_level_args(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0usize;
    for (idx, ch) in s.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            c if !in_string && OPEN_DELIMS.contains(&c) => depth += 1,
            c if !in_string && CLOSE_DELIMS.contains(&c) => depth -= 1,
            ',' if depth == 0 && !in_string => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Parses one layer expression (e.g. `s("bd sd").gain(0.8).fast(2)`).
fn parse_layer(expr: &str) -> Option<PatternLayer> {
    let paren = expr.find('(')?;
    let head = &expr[..paren];
    let source = if KNOWN_SOURCES.contains(&head) {
        Some(head.to_string())
    } else {
        None
    };

    let mut layer = PatternLayer {
        source,
        tokens: None,
        effects: BTreeMap::new(),
        modifiers: Vec::new(),
    };

    let mut rest = &expr[paren..];
    let mut first_call = true;
    while !rest.is_empty() {
        if !rest.starts_with('(') {
            break;
        }
        let (args, remainder) = split_call_args(rest)?;
        if first_call {
            layer.tokens = first_string_literal(args).or_else(|| Some(args.trim().to_string()));
            first_call = false;
            rest = remainder;
        } else {
            // `remainder` starts right after the previous call's `)`.
            rest = remainder;
        }

        if let Some(dot_rest) = rest.strip_prefix('.') {
            let method_end = dot_rest
                .find('(')
                .unwrap_or(dot_rest.len());
            let method = &dot_rest[..method_end];
            let after_method = &dot_rest[method_end..];
            let (method_args, method_remainder) = split_call_args(after_method)?;
            if EFFECT_METHODS.contains(&method) {
                layer
                    .effects
                    .insert(method.to_string(), method_args.trim().to_string());
            } else {
                layer.modifiers.push(method.to_string());
            }
            rest = method_remainder;
        } else {
            break;
        }
    }

    Some(layer)
}

/// Given a string starting with `(`, returns the content between the matching
/// `)` and the remainder of the string after it.
fn split_call_args(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut depth = 0i32;
    for (idx, ch) in s.char_indices() {
        match ch {
            c if OPEN_DELIMS.contains(&c) => depth += 1,
            c if CLOSE_DELIMS.contains(&c) => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[1..idx], &s[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn first_string_literal(s: &str) -> Option<String> {
    let start = s.find('"')?;
    let end = s[start + 1..].find('"')? + start + 1;
    Some(s[start + 1..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_and_no_change_are_always_ok() {
        assert!(validate("silence").is_ok());
        assert!(validate("no_change").is_ok());
    }

    #[test]
    fn balanced_pattern_is_ok() {
        assert!(validate(r#"s("bd sd").gain(0.8)"#).is_ok());
        assert!(validate(r#"stack(s("<bd sd> hh"), note("c e g").sound("piano"))"#).is_ok());
    }

    #[test]
    fn unbalanced_delimiters_are_rejected() {
        assert!(validate(r#"s("bd sd"#).is_err());
        assert!(validate(r#"s("bd [sd")"#).is_err());
        assert!(validate(r#"s("bd <sd])")"#).is_err());
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(validate("").is_err());
        assert!(validate("   ").is_err());
    }

    #[test]
    fn summarize_single_layer() {
        let summary = summarize(r#"s("bd sd").gain(0.8).fast(2)"#).unwrap();
        assert!(summary.contains("bd sd"));
        assert!(summary.contains("gain=0.8"));
        assert!(summary.contains("fast"));
    }

    #[test]
    fn summarize_stack_reports_layer_count() {
        let summary = summarize(r#"stack(s("bd sd"), note("c e g"))"#).unwrap();
        assert!(summary.starts_with("2 layers"));
    }

    #[test]
    fn summarize_silence_is_none() {
        assert_eq!(summarize("silence"), None);
        assert_eq!(summarize("no_change"), None);
    }
}
