// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort parsing of JSON prefixes observed mid-stream.
//!
//! While a structured-JSON call streams, every response delta produces a new
//! prefix of the eventual JSON text.  [`parse_partial_json`] turns such a
//! prefix into a well-formed snapshot: unterminated strings keep their
//! accumulated content, unterminated objects/arrays close early, incomplete
//! keys and dangling commas are dropped.  A snapshot is plain data — schema
//! validation happens only on the finalized text.
//!
//! [`normalize_json_text`] is the finalization half: strip Markdown fences,
//! locate the JSON span, and escape raw control characters inside strings so
//! the strict parser accepts model output that is JSON-shaped but sloppy.

use serde_json::{Map, Number, Value};

/// Outcome of parsing one value from the prefix.
enum Parsed {
    /// A complete value; parsing may continue after it.
    Complete(Value),
    /// Input ended inside the value.  `Some` when a usable partial value was
    /// accumulated (unterminated string, half-filled object), `None` when
    /// nothing usable was read (bare `-`, lone `"` opening an empty string is
    /// still usable and returns `Some("")`).
    Truncated(Option<Value>),
    /// The prefix cannot be the start of valid JSON.
    Malformed,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

/// Parse a best-effort snapshot of a streamed JSON prefix.
///
/// Returns `None` when no JSON value has started yet (prose, an unopened
/// fence) or the prefix is malformed beyond repair.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    let start = json_start(text)?;
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: start,
    };
    match parser.parse_value() {
        Parsed::Complete(v) => Some(v),
        Parsed::Truncated(v) => v,
        Parsed::Malformed => None,
    }
}

/// Find the first byte of the JSON payload, skipping whitespace and a
/// leading Markdown fence line (```` ``` ```` or ```` ```json ````).
fn json_start(text: &str) -> Option<usize> {
    let mut rest = text.trim_start();
    let mut offset = text.len() - rest.len();
    if rest.starts_with("```") {
        match rest.find('\n') {
            Some(nl) => {
                offset += nl + 1;
                rest = &text[offset..];
            }
            // The fence line itself is still streaming.
            None => return None,
        }
    }
    let inner = rest.find(|c| c == '{' || c == '[')?;
    Some(offset + inner)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Parsed {
        self.skip_ws();
        match self.peek() {
            None => Parsed::Truncated(None),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string(),
            Some(b't') => self.parse_literal("true", Value::Bool(true)),
            Some(b'f') => self.parse_literal("false", Value::Bool(false)),
            Some(b'n') => self.parse_literal("null", Value::Null),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(_) => Parsed::Malformed,
        }
    }

    fn parse_object(&mut self) -> Parsed {
        self.bump(); // '{'
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parsed::Truncated(Some(Value::Object(map))),
                Some(b'}') => {
                    self.bump();
                    return Parsed::Complete(Value::Object(map));
                }
                Some(b',') => {
                    self.bump();
                    continue;
                }
                Some(b'"') => {}
                Some(_) => return Parsed::Malformed,
            }
            // Key.
            let key = match self.parse_string() {
                Parsed::Complete(Value::String(k)) => k,
                // Key still streaming: drop it and close the snapshot.
                Parsed::Truncated(_) => return Parsed::Truncated(Some(Value::Object(map))),
                _ => return Parsed::Malformed,
            };
            self.skip_ws();
            match self.peek() {
                // `"key"` with no colon yet.
                None => return Parsed::Truncated(Some(Value::Object(map))),
                Some(b':') => {
                    self.bump();
                }
                Some(_) => return Parsed::Malformed,
            }
            match self.parse_value() {
                Parsed::Complete(v) => {
                    map.insert(key, v);
                }
                Parsed::Truncated(Some(v)) => {
                    map.insert(key, v);
                    return Parsed::Truncated(Some(Value::Object(map)));
                }
                // `"key":` with the value not started.
                Parsed::Truncated(None) => return Parsed::Truncated(Some(Value::Object(map))),
                Parsed::Malformed => return Parsed::Malformed,
            }
        }
    }

    fn parse_array(&mut self) -> Parsed {
        self.bump(); // '['
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parsed::Truncated(Some(Value::Array(items))),
                Some(b']') => {
                    self.bump();
                    return Parsed::Complete(Value::Array(items));
                }
                Some(b',') => {
                    self.bump();
                    continue;
                }
                Some(_) => {}
            }
            match self.parse_value() {
                Parsed::Complete(v) => items.push(v),
                Parsed::Truncated(Some(v)) => {
                    items.push(v);
                    return Parsed::Truncated(Some(Value::Array(items)));
                }
                Parsed::Truncated(None) => return Parsed::Truncated(Some(Value::Array(items))),
                Parsed::Malformed => return Parsed::Malformed,
            }
        }
    }

    fn parse_string(&mut self) -> Parsed {
        self.bump(); // '"'
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Parsed::Truncated(Some(Value::String(out))),
                Some(b'"') => return Parsed::Complete(Value::String(out)),
                Some(b'\\') => match self.bump() {
                    // Escape split across deltas: drop the half escape.
                    None => return Parsed::Truncated(Some(Value::String(out))),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'b') => out.push('\u{0008}'),
                    Some(b'f') => out.push('\u{000C}'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'u') => {
                        let remaining = self.bytes.len() - self.pos;
                        if remaining < 4 {
                            self.pos = self.bytes.len();
                            return Parsed::Truncated(Some(Value::String(out)));
                        }
                        let hex = &self.bytes[self.pos..self.pos + 4];
                        self.pos += 4;
                        let code = std::str::from_utf8(hex)
                            .ok()
                            .and_then(|h| u32::from_str_radix(h, 16).ok())
                            .and_then(char::from_u32);
                        match code {
                            Some(c) => out.push(c),
                            None => return Parsed::Malformed,
                        }
                    }
                    Some(_) => return Parsed::Malformed,
                },
                Some(b) if b < 0x80 => out.push(b as char),
                Some(b) => {
                    // Re-assemble a multi-byte UTF-8 sequence.  A sequence cut
                    // by the delta boundary truncates the string here.
                    let len = utf8_len(b);
                    let start = self.pos - 1;
                    if start + len > self.bytes.len() {
                        self.pos = self.bytes.len();
                        return Parsed::Truncated(Some(Value::String(out)));
                    }
                    match std::str::from_utf8(&self.bytes[start..start + len]) {
                        Ok(s) => {
                            out.push_str(s);
                            self.pos = start + len;
                        }
                        Err(_) => return Parsed::Malformed,
                    }
                }
            }
        }
    }

    fn parse_literal(&mut self, literal: &str, value: Value) -> Parsed {
        let remaining = &self.bytes[self.pos..];
        let lit = literal.as_bytes();
        let common = remaining.len().min(lit.len());
        if remaining[..common] != lit[..common] {
            return Parsed::Malformed;
        }
        if common < lit.len() {
            // A prefix of the literal at end of input.
            self.pos = self.bytes.len();
            return Parsed::Truncated(Some(value));
        }
        self.pos += lit.len();
        Parsed::Complete(value)
    }

    fn parse_number(&mut self) -> Parsed {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        let at_end = self.pos == self.bytes.len();
        let mut slice = &self.bytes[start..self.pos];
        // Trim a dangling sign/dot/exponent so "12." or "3e" parses as far as
        // the digits go.
        while let Some(last) = slice.last() {
            if matches!(last, b'-' | b'+' | b'.' | b'e' | b'E') {
                slice = &slice[..slice.len() - 1];
            } else {
                break;
            }
        }
        if slice.is_empty() {
            return if at_end {
                Parsed::Truncated(None)
            } else {
                Parsed::Malformed
            };
        }
        let text = std::str::from_utf8(slice).expect("number bytes are ASCII");
        let number = text
            .parse::<i64>()
            .ok()
            .map(Number::from)
            .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64));
        match number {
            Some(n) => {
                if at_end {
                    Parsed::Truncated(Some(Value::Number(n)))
                } else {
                    Parsed::Complete(Value::Number(n))
                }
            }
            None => Parsed::Malformed,
        }
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ─── Finalization ─────────────────────────────────────────────────────────────

/// Normalize finalized model output into strict-parseable JSON text.
///
/// Strips Markdown fences, cuts the text down to the JSON span (first opening
/// brace/bracket through the matching last closing one), and escapes raw
/// control characters that models sometimes leave inside string literals.
/// Returns `None` when no JSON span exists.
pub fn normalize_json_text(text: &str) -> Option<String> {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = body.splitn(2, '\n').nth(1).unwrap_or("");
        if let Some(end) = body.rfind("```") {
            body = &body[..end];
        }
        body = body.trim();
    }
    let start = body.find(|c| c == '{' || c == '[')?;
    let end = body.rfind(|c| c == '}' || c == ']')?;
    if end < start {
        return None;
    }
    Some(escape_raw_control_chars(&body[start..=end]))
}

/// Escape raw newlines / carriage returns / tabs occurring inside string
/// literals.  Characters outside strings are left alone.
fn escape_raw_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
