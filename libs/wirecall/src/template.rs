//! URI template parsing and expansion.
//!
//! Templates are literal text with `{name}` placeholders. Parsing is a single
//! left-to-right pass and never fails: any brace run that does not form a
//! well-formed placeholder (nested braces, unterminated `{`, characters
//! outside `[A-Za-z0-9_-]`) is kept verbatim as literal text. Expansion
//! percent-encodes substituted values only; literal text passes through
//! untouched, so pre-encoded literals like `%2F` survive round trips.

use std::collections::HashMap;
use std::fmt;

use crate::error::TemplateError;

/// How expansion treats placeholders with no bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpandMode {
    /// Unresolved placeholder fails the expansion. Used for URI, query and
    /// header templates.
    #[default]
    Strict,
    /// Unresolved placeholder is left in place as literal `{name}` text.
    /// Used for body templates.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Literal(String),
    Expression(String),
}

/// A parsed template, ready for repeated expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    chunks: Vec<Chunk>,
    mode: ExpandMode,
    /// Percent-encode values into substituted text. Body templates turn
    /// this off.
    encode_values: bool,
    /// Encode `/` inside substituted values as `%2F`. Has no effect on
    /// literal text.
    encode_slash: bool,
}

/// A value bound to a placeholder name for one expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarValue {
    Single { value: String, encoded: bool },
    Multi { values: Vec<String>, encoded: bool },
}

impl VarValue {
    /// A plain value that expansion will percent-encode.
    pub fn single(value: impl Into<String>) -> Self {
        VarValue::Single {
            value: value.into(),
            encoded: false,
        }
    }

    /// A value the caller already percent-encoded; expansion substitutes it
    /// verbatim.
    pub fn pre_encoded(value: impl Into<String>) -> Self {
        VarValue::Single {
            value: value.into(),
            encoded: true,
        }
    }

    /// A multi-valued binding. Plain templates join the values with commas;
    /// query templates may instead repeat the parameter per value.
    pub fn multi<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        VarValue::Multi {
            values: values.into_iter().map(Into::into).collect(),
            encoded: false,
        }
    }
}

/// Placeholder bindings for one expansion.
pub type VarMap = HashMap<String, VarValue>;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Template {
    /// Parses `source` in a single pass. Never fails; malformed placeholder
    /// syntax is demoted to literal text.
    #[must_use]
    pub fn parse(source: &str, mode: ExpandMode, encode_slash: bool) -> Self {
        Self::parse_with(source, mode, true, encode_slash)
    }

    /// Parses a body template: lenient by convention and without value
    /// percent-encoding.
    #[must_use]
    pub fn parse_body(source: &str) -> Self {
        Self::parse_with(source, ExpandMode::Lenient, false, false)
    }

    /// Parses a header value template: strict, but never percent-encoded
    /// since header values are not URI components.
    #[must_use]
    pub fn parse_header(source: &str) -> Self {
        Self::parse_with(source, ExpandMode::Strict, false, false)
    }

    fn parse_with(source: &str, mode: ExpandMode, encode_values: bool, encode_slash: bool) -> Self {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut literal = String::new();
        let chars: Vec<char> = source.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] == '{' {
                // A doubled brace is literal; consume both so the inner
                // text is never rescanned as an expression.
                if chars.get(i + 1) == Some(&'{') {
                    literal.push_str("{{");
                    i += 2;
                    continue;
                }
                // Scan ahead for a well-formed `{name}`. Anything else
                // falls back to literal text.
                let mut j = i + 1;
                let mut name = String::new();
                let mut well_formed = false;
                while j < chars.len() {
                    let c = chars[j];
                    if c == '}' {
                        well_formed = !name.is_empty();
                        break;
                    }
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    j += 1;
                }
                if well_formed {
                    if !literal.is_empty() {
                        chunks.push(Chunk::Literal(std::mem::take(&mut literal)));
                    }
                    chunks.push(Chunk::Expression(name));
                    i = j + 1;
                    continue;
                }
            }
            literal.push(chars[i]);
            i += 1;
        }
        if !literal.is_empty() {
            chunks.push(Chunk::Literal(literal));
        }

        Template {
            source: source.to_owned(),
            chunks,
            mode,
            encode_values,
            encode_slash,
        }
    }

    /// The original template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no placeholders.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| matches!(c, Chunk::Literal(_)))
    }

    /// Placeholder names in order of first appearance, without duplicates.
    #[must_use]
    pub fn variables(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for chunk in &self.chunks {
            if let Chunk::Expression(name) = chunk {
                if !seen.contains(&name.as_str()) {
                    seen.push(name);
                }
            }
        }
        seen
    }

    /// When the whole template is a single placeholder, returns its name.
    /// Query value templates use this to detect the repeated-parameter case.
    #[must_use]
    pub fn sole_variable(&self) -> Option<&str> {
        match self.chunks.as_slice() {
            [Chunk::Expression(name)] => Some(name.as_str()),
            _ => None,
        }
    }

    /// Expands the template against `vars`.
    pub fn expand(&self, vars: &VarMap) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for chunk in &self.chunks {
            match chunk {
                Chunk::Literal(text) => out.push_str(text),
                Chunk::Expression(name) => match vars.get(name) {
                    Some(value) => self.push_value(&mut out, value),
                    None => match self.mode {
                        ExpandMode::Strict => {
                            return Err(TemplateError::Unresolved {
                                name: name.clone(),
                                template: self.source.clone(),
                            });
                        }
                        ExpandMode::Lenient => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    },
                },
            }
        }
        Ok(out)
    }

    fn push_value(&self, out: &mut String, value: &VarValue) {
        match value {
            VarValue::Single { value, encoded } => {
                self.push_one(out, value, *encoded);
            }
            VarValue::Multi { values, encoded } => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.push_one(out, v, *encoded);
                }
            }
        }
    }

    fn push_one(&self, out: &mut String, value: &str, pre_encoded: bool) {
        if pre_encoded || !self.encode_values {
            out.push_str(value);
        } else {
            percent_encode_into(out, value, self.encode_slash);
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn percent_encode_into(out: &mut String, value: &str, encode_slash: bool) {
    for &b in value.as_bytes() {
        if is_unreserved(b) || (b == b'/' && !encode_slash) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
}

/// Percent-encodes `value`, keeping RFC 3986 unreserved characters.
/// With `encode_slash == false` the path separator also passes through.
#[must_use]
pub fn percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    percent_encode_into(&mut out, value, encode_slash);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), VarValue::single(*v)))
            .collect()
    }

    #[test]
    fn expands_multiple_placeholders() {
        let t = Template::parse("/repos/{owner}/{repo}/contributors", ExpandMode::Strict, true);
        let out = t
            .expand(&vars(&[("owner", "netflix"), ("repo", "feign")]))
            .unwrap();
        assert_eq!(out, "/repos/netflix/feign/contributors");
    }

    #[test]
    fn strict_mode_fails_on_unresolved() {
        let t = Template::parse("/repos/{owner}", ExpandMode::Strict, true);
        let err = t.expand(&VarMap::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                name: "owner".into(),
                template: "/repos/{owner}".into(),
            }
        );
    }

    #[test]
    fn lenient_mode_keeps_unresolved_placeholders() {
        let t = Template::parse("hello {name}!", ExpandMode::Lenient, true);
        assert_eq!(t.expand(&VarMap::new()).unwrap(), "hello {name}!");

        let t = Template::parse_body("{\"a\": \"{a}\", \"b\": \"{b}\"}");
        let mut m = VarMap::new();
        m.insert("a".into(), VarValue::single("x"));
        assert_eq!(t.expand(&m).unwrap(), "{\"a\": \"x\", \"b\": \"{b}\"}");
    }

    #[test]
    fn nested_braces_are_literal() {
        let t = Template::parse("/a/{{b}}/c", ExpandMode::Strict, true);
        assert!(t.is_literal());
        assert_eq!(t.expand(&VarMap::new()).unwrap(), "/a/{{b}}/c");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        let t = Template::parse("/a/{b", ExpandMode::Strict, true);
        assert!(t.is_literal());
        assert_eq!(t.expand(&VarMap::new()).unwrap(), "/a/{b");
    }

    #[test]
    fn invalid_name_chars_demote_to_literal() {
        let t = Template::parse("/a/{b c}/d", ExpandMode::Strict, true);
        assert!(t.is_literal());
    }

    #[test]
    fn empty_braces_are_literal() {
        let t = Template::parse("/a/{}/b", ExpandMode::Strict, true);
        assert!(t.is_literal());
    }

    #[test]
    fn values_are_encoded_literals_are_not() {
        let t = Template::parse("/v1%2Fapi/{id}", ExpandMode::Strict, true);
        let out = t.expand(&vars(&[("id", "a/b")])).unwrap();
        assert_eq!(out, "/v1%2Fapi/a%2Fb");
    }

    #[test]
    fn encode_slash_off_preserves_path_separators() {
        let t = Template::parse("/files/{path}", ExpandMode::Strict, false);
        let out = t.expand(&vars(&[("path", "a/b c")])).unwrap();
        assert_eq!(out, "/files/a/b%20c");
    }

    #[test]
    fn pre_encoded_values_pass_through() {
        let t = Template::parse("/files/{path}", ExpandMode::Strict, true);
        let mut m = VarMap::new();
        m.insert("path".into(), VarValue::pre_encoded("a%2Fb"));
        assert_eq!(t.expand(&m).unwrap(), "/files/a%2Fb");
    }

    #[test]
    fn multi_value_joins_with_commas() {
        let t = Template::parse("{ids}", ExpandMode::Strict, true);
        let mut m = VarMap::new();
        m.insert("ids".into(), VarValue::multi(["1", "2", "3"]));
        assert_eq!(t.expand(&m).unwrap(), "1,2,3");
    }

    #[test]
    fn variables_deduplicated_in_order() {
        let t = Template::parse("/{a}/{b}/{a}", ExpandMode::Strict, true);
        assert_eq!(t.variables(), vec!["a", "b"]);
    }

    #[test]
    fn sole_variable_detection() {
        assert_eq!(
            Template::parse("{id}", ExpandMode::Strict, true).sole_variable(),
            Some("id")
        );
        assert_eq!(
            Template::parse("x{id}", ExpandMode::Strict, true).sole_variable(),
            None
        );
    }

    #[test]
    fn body_template_does_not_encode() {
        let t = Template::parse_body("{\"name\": \"{name}\"}");
        let out = t.expand(&vars(&[("name", "a b/c")])).unwrap();
        assert_eq!(out, "{\"name\": \"a b/c\"}");
    }

    #[test]
    fn percent_encode_unreserved_untouched() {
        assert_eq!(percent_encode("AZaz09-._~", true), "AZaz09-._~");
        assert_eq!(percent_encode("a b&c", true), "a%20b%26c");
        assert_eq!(percent_encode("a/b", false), "a/b");
        assert_eq!(percent_encode("a/b", true), "a%2Fb");
    }

    #[test]
    fn expansion_is_repeatable() {
        let t = Template::parse("/u/{id}", ExpandMode::Strict, true);
        let m = vars(&[("id", "42")]);
        assert_eq!(t.expand(&m).unwrap(), "/u/42");
        assert_eq!(t.expand(&m).unwrap(), "/u/42");
    }
}
