//! Mutable request template and the immutable request it resolves into.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Uri};

use crate::error::{InvokeError, TemplateError};
use crate::template::{percent_encode, ExpandMode, Template, VarMap, VarValue};

/// How multi-valued query parameters render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionFormat {
    /// One `name=value` pair per element: `id=1&id=2&id=3`.
    #[default]
    Exploded,
    /// A single comma-joined pair: `id=1,2,3`.
    Csv,
}

/// Per-call transport options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Timeout for one full request attempt, connect excluded.
    pub read_timeout: Duration,
    /// Follow 3xx redirects inside the client.
    pub follow_redirects: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            follow_redirects: true,
        }
    }
}

impl Options {
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

/// Body carried by a template.
#[derive(Debug, Clone, Default)]
pub enum BodySpec {
    /// No body.
    #[default]
    None,
    /// Fixed bytes, set by an encoder or directly by the caller.
    Literal(Bytes),
    /// Text with placeholders, expanded leniently and without
    /// percent-encoding at resolve time.
    Template(Template),
}

/// An ordered, mutable blueprint for one HTTP request.
///
/// Every part may contain `{name}` placeholders until [`resolve`] replaces
/// them with argument values. Query parameters and headers preserve insertion
/// order. The template is cheap to clone; each invocation works on a fresh
/// clone so the parsed original is never mutated.
///
/// [`resolve`]: RequestTemplate::resolve
#[derive(Debug, Clone, Default)]
pub struct RequestTemplate {
    method: Option<Method>,
    path: String,
    queries: Vec<(String, Vec<String>)>,
    headers: Vec<(String, Vec<String>)>,
    body: BodySpec,
    encode_slash: bool,
    collection_format: CollectionFormat,
    resolved: bool,
}

impl RequestTemplate {
    #[must_use]
    pub fn new() -> Self {
        RequestTemplate {
            encode_slash: true,
            ..Default::default()
        }
    }

    pub fn set_method(&mut self, method: Method) -> &mut Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Appends a path segment. An inline query string (`?a={b}`) is split
    /// off and merged into the query multimap.
    pub fn append_path(&mut self, path: &str) -> &mut Self {
        let (path_part, query_part) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        if !path_part.is_empty() {
            if !self.path.is_empty() && self.path.ends_with('/') && path_part.starts_with('/') {
                self.path.pop();
            }
            self.path.push_str(path_part);
        }
        if let Some(query) = query_part {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((name, value)) => self.query(name, value),
                    None => self.query(pair, ""),
                };
            }
        }
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when the path already names a scheme and authority, in which
    /// case the target base URL is not prepended.
    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }

    /// Appends one query parameter value template under `name`.
    pub fn query(&mut self, name: &str, value: &str) -> &mut Self {
        match self.queries.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value.to_owned()),
            None => self.queries.push((name.to_owned(), vec![value.to_owned()])),
        }
        self
    }

    /// Appends a final (already resolved) query value. Interceptors use this
    /// after resolution; the value is percent-encoded here. Names are kept
    /// raw so the entry merges with templated parameters of the same name.
    pub fn query_literal(&mut self, name: &str, value: &str) -> &mut Self {
        let encoded = percent_encode(value, true);
        match self.queries.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(encoded),
            None => self.queries.push((name.to_owned(), vec![encoded])),
        }
        self
    }

    #[must_use]
    pub fn queries(&self) -> &[(String, Vec<String>)] {
        &self.queries
    }

    /// Appends a header value template under `name`. Repeated names keep
    /// every value.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value.to_owned()),
            None => self.headers.push((name.to_owned(), vec![value.to_owned()])),
        }
        self
    }

    /// Sets `name` to exactly one value, dropping previous ones. Used for
    /// single-winner headers such as `Content-Type` and `Accept`.
    pub fn replace_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), vec![value.to_owned()]));
        self
    }

    #[must_use]
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, Vec<String>)] {
        &self.headers
    }

    /// Sets a fixed body and, unless one is present, its content type.
    pub fn body_literal(&mut self, bytes: Bytes, content_type: Option<&str>) -> &mut Self {
        self.body = BodySpec::Literal(bytes);
        if let Some(ct) = content_type {
            if !self.has_header(CONTENT_TYPE.as_str()) {
                self.replace_header(CONTENT_TYPE.as_str(), ct);
            }
        }
        self
    }

    /// Sets a placeholder-bearing body template.
    pub fn body_template(&mut self, source: &str) -> &mut Self {
        self.body = BodySpec::Template(Template::parse_body(source));
        self
    }

    #[must_use]
    pub fn body(&self) -> &BodySpec {
        &self.body
    }

    pub fn set_encode_slash(&mut self, encode_slash: bool) -> &mut Self {
        self.encode_slash = encode_slash;
        self
    }

    #[must_use]
    pub fn encode_slash(&self) -> bool {
        self.encode_slash
    }

    pub fn set_collection_format(&mut self, format: CollectionFormat) -> &mut Self {
        self.collection_format = format;
        self
    }

    #[must_use]
    pub fn collection_format(&self) -> CollectionFormat {
        self.collection_format
    }

    /// True once [`resolve`](RequestTemplate::resolve) produced this
    /// template.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Placeholder names referenced anywhere in the template, in order of
    /// first appearance. Contract validation checks bindings against this.
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut push_all = |template: &Template| {
            for name in template.variables() {
                if !seen.iter().any(|s| s == name) {
                    seen.push(name.to_owned());
                }
            }
        };
        push_all(&Template::parse(&self.path, ExpandMode::Strict, self.encode_slash));
        for (_, values) in &self.queries {
            for value in values {
                push_all(&Template::parse(value, ExpandMode::Strict, true));
            }
        }
        for (_, values) in &self.headers {
            for value in values {
                push_all(&Template::parse(value, ExpandMode::Strict, true));
            }
        }
        if let BodySpec::Template(template) = &self.body {
            push_all(template);
        }
        seen
    }

    /// Expands every placeholder against `vars`, producing a resolved
    /// template ready for targeting. `self` is untouched.
    pub fn resolve(&self, vars: &VarMap) -> Result<RequestTemplate, TemplateError> {
        let path_template = Template::parse(&self.path, ExpandMode::Strict, self.encode_slash);
        let path = path_template.expand(vars)?;

        let mut queries: Vec<(String, Vec<String>)> = Vec::with_capacity(self.queries.len());
        for (name, value_templates) in &self.queries {
            let mut values: Vec<String> = Vec::with_capacity(value_templates.len());
            for value_template in value_templates {
                let template = Template::parse(value_template, ExpandMode::Strict, true);
                // A bare `{name}` bound to a multi-value expands to one
                // entry per element so CollectionFormat can decide the
                // final rendering.
                if let Some(var) = template.sole_variable() {
                    if let Some(VarValue::Multi { values: items, encoded }) = vars.get(var) {
                        for item in items {
                            values.push(if *encoded {
                                item.clone()
                            } else {
                                percent_encode(item, true)
                            });
                        }
                        continue;
                    }
                }
                values.push(template.expand(vars)?);
            }
            queries.push((name.clone(), values));
        }

        let mut headers: Vec<(String, Vec<String>)> = Vec::with_capacity(self.headers.len());
        for (name, value_templates) in &self.headers {
            let mut values: Vec<String> = Vec::with_capacity(value_templates.len());
            for value_template in value_templates {
                let template = Template::parse_header(value_template);
                values.push(template.expand(vars)?);
            }
            headers.push((name.clone(), values));
        }

        let body = match &self.body {
            BodySpec::None => BodySpec::None,
            BodySpec::Literal(bytes) => BodySpec::Literal(bytes.clone()),
            BodySpec::Template(template) => {
                BodySpec::Literal(Bytes::from(template.expand(vars)?))
            }
        };

        Ok(RequestTemplate {
            method: self.method.clone(),
            path,
            queries,
            headers,
            body,
            encode_slash: self.encode_slash,
            collection_format: self.collection_format,
            resolved: true,
        })
    }

    /// Renders the resolved query multimap into a query string, applying the
    /// collection format to multi-valued parameters. Returns `None` when
    /// there are no parameters.
    #[must_use]
    pub fn query_string(&self) -> Option<String> {
        if self.queries.is_empty() {
            return None;
        }
        let mut out = String::new();
        for (name, values) in &self.queries {
            let name = percent_encode(name, true);
            let mut push_pair = |value: &str| {
                if !out.is_empty() {
                    out.push('&');
                }
                out.push_str(&name);
                if !value.is_empty() {
                    out.push('=');
                    out.push_str(value);
                }
            };
            if values.is_empty() {
                push_pair("");
            } else {
                match self.collection_format {
                    CollectionFormat::Exploded => {
                        for value in values {
                            push_pair(value);
                        }
                    }
                    CollectionFormat::Csv => push_pair(&values.join(",")),
                }
            }
        }
        Some(out)
    }

    /// Builds the final immutable request against an optional base URL.
    /// The base is prepended unless the resolved path is already absolute.
    pub fn into_request(self, base: Option<&str>) -> Result<Request, InvokeError> {
        let mut url = if self.is_absolute() {
            self.path.clone()
        } else {
            match base {
                Some(base) => {
                    let mut url = base.trim_end_matches('/').to_owned();
                    if !self.path.starts_with('/') && !self.path.is_empty() {
                        url.push('/');
                    }
                    url.push_str(&self.path);
                    url
                }
                None => self.path.clone(),
            }
        };
        if let Some(query) = self.query_string() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }

        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            InvokeError::InvalidUri {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(InvokeError::InvalidUri {
                url,
                reason: "URL must be absolute".into(),
            });
        }

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, values) in &self.headers {
            let header_name: HeaderName = name.parse()?;
            for value in values {
                headers.append(header_name.clone(), HeaderValue::from_str(value)?);
            }
        }

        let body = match self.body {
            BodySpec::None => None,
            BodySpec::Literal(bytes) => Some(bytes),
            // Only reachable when targeting an unresolved template.
            BodySpec::Template(template) => Some(Bytes::from(template.source().to_owned())),
        };

        Ok(Request {
            method: self.method.unwrap_or(Method::GET),
            uri,
            headers,
            body,
        })
    }
}

/// The immutable product of resolving and targeting a template.
/// Cloned per attempt when retrying.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Option<Bytes>) {
        (self.method, self.uri, self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VarValue;

    fn vars(pairs: &[(&str, &str)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), VarValue::single(*v)))
            .collect()
    }

    #[test]
    fn inline_query_string_splits_into_multimap() {
        let mut t = RequestTemplate::new();
        t.append_path("/search?q={q}&sort=stars");
        assert_eq!(t.path(), "/search");
        assert_eq!(
            t.queries(),
            &[
                ("q".to_owned(), vec!["{q}".to_owned()]),
                ("sort".to_owned(), vec!["stars".to_owned()]),
            ]
        );
    }

    #[test]
    fn resolve_expands_path_and_query() {
        let mut t = RequestTemplate::new();
        t.set_method(Method::GET)
            .append_path("/repos/{owner}/{repo}/contributors")
            .query("anon", "{anon}");
        let resolved = t
            .resolve(&vars(&[("owner", "netflix"), ("repo", "feign"), ("anon", "true")]))
            .unwrap();
        assert_eq!(resolved.path(), "/repos/netflix/feign/contributors");
        assert_eq!(resolved.query_string().as_deref(), Some("anon=true"));
        assert!(resolved.is_resolved());
    }

    #[test]
    fn exploded_multi_value_query() {
        let mut t = RequestTemplate::new();
        t.query("id", "{ids}");
        let mut m = VarMap::new();
        m.insert("ids".into(), VarValue::multi(["1", "2", "3"]));
        let resolved = t.resolve(&m).unwrap();
        assert_eq!(resolved.query_string().as_deref(), Some("id=1&id=2&id=3"));
    }

    #[test]
    fn csv_multi_value_query() {
        let mut t = RequestTemplate::new();
        t.set_collection_format(CollectionFormat::Csv);
        t.query("id", "{ids}");
        let mut m = VarMap::new();
        m.insert("ids".into(), VarValue::multi(["1", "2", "3"]));
        let resolved = t.resolve(&m).unwrap();
        assert_eq!(resolved.query_string().as_deref(), Some("id=1,2,3"));
    }

    #[test]
    fn encode_slash_controls_path_values() {
        let mut t = RequestTemplate::new();
        t.append_path("/files/{path}");
        let resolved = t.resolve(&vars(&[("path", "a/b")])).unwrap();
        assert_eq!(resolved.path(), "/files/a%2Fb");

        let mut t = RequestTemplate::new();
        t.set_encode_slash(false);
        t.append_path("/files/{path}");
        let resolved = t.resolve(&vars(&[("path", "a/b")])).unwrap();
        assert_eq!(resolved.path(), "/files/a/b");
    }

    #[test]
    fn repeated_header_keeps_all_values() {
        let mut t = RequestTemplate::new();
        t.header("X-Trace", "a").header("X-Trace", "b");
        assert_eq!(t.headers(), &[("X-Trace".to_owned(), vec!["a".to_owned(), "b".to_owned()])]);
    }

    #[test]
    fn replace_header_is_single_winner() {
        let mut t = RequestTemplate::new();
        t.header("Accept", "text/plain");
        t.replace_header("accept", "application/json");
        assert_eq!(
            t.headers(),
            &[("accept".to_owned(), vec!["application/json".to_owned()])]
        );
    }

    #[test]
    fn body_literal_sets_content_type_only_when_absent() {
        let mut t = RequestTemplate::new();
        t.replace_header("Content-Type", "application/vnd.custom+json");
        t.body_literal(Bytes::from_static(b"{}"), Some("application/json"));
        assert_eq!(
            t.headers(),
            &[("Content-Type".to_owned(), vec!["application/vnd.custom+json".to_owned()])]
        );
    }

    #[test]
    fn body_template_expands_without_encoding() {
        let mut t = RequestTemplate::new();
        t.body_template("{\"user\": \"{name}\"}");
        let resolved = t.resolve(&vars(&[("name", "a b")])).unwrap();
        match resolved.body() {
            BodySpec::Literal(bytes) => assert_eq!(&bytes[..], b"{\"user\": \"a b\"}"),
            other => panic!("expected literal body, got {other:?}"),
        }
    }

    #[test]
    fn into_request_prepends_base_unless_absolute() {
        let mut t = RequestTemplate::new();
        t.set_method(Method::GET).append_path("/users/1");
        let req = t
            .resolve(&VarMap::new())
            .unwrap()
            .into_request(Some("https://api.example.com/"))
            .unwrap();
        assert_eq!(req.uri().to_string(), "https://api.example.com/users/1");

        let mut t = RequestTemplate::new();
        t.set_method(Method::GET)
            .append_path("https://other.example.com/ping");
        let req = t
            .resolve(&VarMap::new())
            .unwrap()
            .into_request(Some("https://api.example.com"))
            .unwrap();
        assert_eq!(req.uri().to_string(), "https://other.example.com/ping");
    }

    #[test]
    fn into_request_rejects_relative_url() {
        let mut t = RequestTemplate::new();
        t.append_path("/users/1");
        let err = t
            .resolve(&VarMap::new())
            .unwrap()
            .into_request(None)
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidUri { .. }));
    }

    #[test]
    fn query_literal_encodes_value() {
        let mut t = RequestTemplate::new();
        t.query_literal("token", "a b&c");
        assert_eq!(t.queries(), &[("token".to_owned(), vec!["a%20b%26c".to_owned()])]);
    }

    #[test]
    fn query_literal_merges_with_existing_parameter() {
        let mut t = RequestTemplate::new();
        t.query("tag", "{tag}");
        let mut resolved = t.resolve(&vars(&[("tag", "rust")])).unwrap();
        resolved.query_literal("tag", "http");
        assert_eq!(
            resolved.query_string().as_deref(),
            Some("tag=rust&tag=http")
        );
    }

    #[test]
    fn query_names_are_encoded_at_render() {
        let mut t = RequestTemplate::new();
        t.query_literal("user name", "a");
        t.query_literal("user name", "b");
        assert_eq!(
            t.query_string().as_deref(),
            Some("user%20name=a&user%20name=b")
        );
    }

    #[test]
    fn variables_collects_all_parts() {
        let mut t = RequestTemplate::new();
        t.append_path("/repos/{owner}/{repo}")
            .query("page", "{page}")
            .header("Authorization", "token {auth}");
        t.body_template("{\"note\": \"{note}\"}");
        assert_eq!(t.variables(), vec!["owner", "repo", "page", "auth", "note"]);
    }
}
