//! Declarative API descriptions and the contract that parses them into
//! method descriptors.
//!
//! An [`ApiDescription`] carries markers (opaque `Any` values) at the API,
//! method and parameter levels. A [`DeclarativeContract`] holds handler
//! registries keyed by marker `TypeId` and folds the markers of each method
//! into a validated [`MethodDescriptor`]. Custom dialects register their own
//! marker types next to (or instead of) the built-in ones.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use http::Method;

use crate::codec::ResultType;
use crate::error::ContractError;
use crate::request::{CollectionFormat, RequestTemplate};

type MarkerBox = Box<dyn Any + Send + Sync>;

static NEXT_DESCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Declarative description of one remote API.
///
/// Each description carries a process-unique identity, so contract caches
/// distinguish two descriptions even when they share a name.
pub struct ApiDescription {
    id: u64,
    name: String,
    markers: Vec<MarkerBox>,
    methods: Vec<MethodDescription>,
}

impl ApiDescription {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ApiDescription {
            id: NEXT_DESCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            markers: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Attaches an API-level marker, applied to every method.
    #[must_use]
    pub fn marker<M: Any + Send + Sync>(mut self, marker: M) -> Self {
        self.markers.push(Box::new(marker));
        self
    }

    #[must_use]
    pub fn method(mut self, method: MethodDescription) -> Self {
        self.methods.push(method);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodDescription] {
        &self.methods
    }
}

/// One callable operation of an API.
pub struct MethodDescription {
    name: String,
    markers: Vec<MarkerBox>,
    params: Vec<ParamDescription>,
    result: ResultType,
}

impl MethodDescription {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        MethodDescription {
            name: name.into(),
            markers: Vec::new(),
            params: Vec::new(),
            result: ResultType::unit(),
        }
    }

    #[must_use]
    pub fn marker<M: Any + Send + Sync>(mut self, marker: M) -> Self {
        self.markers.push(Box::new(marker));
        self
    }

    #[must_use]
    pub fn param(mut self, param: ParamDescription) -> Self {
        self.params.push(param);
        self
    }

    /// Declares the result type. Defaults to [`ResultType::unit`].
    #[must_use]
    pub fn returning(mut self, result: ResultType) -> Self {
        self.result = result;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One positional parameter of a method.
pub struct ParamDescription {
    name: String,
    markers: Vec<MarkerBox>,
}

impl ParamDescription {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ParamDescription {
            name: name.into(),
            markers: Vec::new(),
        }
    }

    #[must_use]
    pub fn marker<M: Any + Send + Sync>(mut self, marker: M) -> Self {
        self.markers.push(Box::new(marker));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// Built-in marker dialect.

/// HTTP verb plus path template for a method. Exactly one per method.
#[derive(Debug, Clone)]
pub struct RequestLine {
    method: Method,
    path: String,
    encode_slash: bool,
    collection_format: CollectionFormat,
}

impl RequestLine {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RequestLine {
            method,
            path: path.into(),
            encode_slash: true,
            collection_format: CollectionFormat::default(),
        }
    }

    /// Parses a textual request line such as `"GET /repos/{owner}"`.
    pub fn parse(line: &str) -> Result<Self, ContractError> {
        let mut parts = line.trim().splitn(2, ' ');
        let verb = parts.next().unwrap_or_default();
        let path = parts.next().map(str::trim).unwrap_or_default();
        if verb.is_empty() || path.is_empty() {
            return Err(ContractError::InvalidRequestLine {
                line: line.to_owned(),
                reason: "expected '<VERB> <path>'".into(),
            });
        }
        let method =
            Method::from_bytes(verb.as_bytes()).map_err(|_| ContractError::InvalidRequestLine {
                line: line.to_owned(),
                reason: format!("unknown verb '{verb}'"),
            })?;
        Ok(Self::new(method, path))
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Keeps `/` inside expanded path values instead of encoding it
    /// as `%2F`.
    #[must_use]
    pub fn preserve_slashes(mut self) -> Self {
        self.encode_slash = false;
        self
    }

    #[must_use]
    pub fn collection_format(mut self, format: CollectionFormat) -> Self {
        self.collection_format = format;
        self
    }
}

/// Static header lines of the form `"Name: value"`; values may carry
/// placeholders. `Content-Type` and `Accept` are single-winner.
#[derive(Debug, Clone)]
pub struct HeaderLines(Vec<String>);

impl HeaderLines {
    #[must_use]
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HeaderLines(lines.into_iter().map(Into::into).collect())
    }
}

/// Binds a parameter to a `{name}` placeholder.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    encoded: bool,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            encoded: false,
        }
    }

    /// The argument arrives already percent-encoded; expansion substitutes
    /// it verbatim.
    #[must_use]
    pub fn pre_encoded(mut self) -> Self {
        self.encoded = true;
        self
    }
}

/// The parameter becomes the request body, serialized by the encoder.
/// A parameter with no markers plays this role implicitly.
#[derive(Debug, Clone, Copy)]
pub struct BodyParam;

/// Method-level body template with placeholders, expanded leniently and
/// without percent-encoding.
#[derive(Debug, Clone)]
pub struct BodyTemplate(pub String);

/// The parameter is a map-like value flattened into query parameters at
/// call time.
#[derive(Debug, Clone, Copy)]
pub struct QueryMapParam;

/// The parameter takes no part in the request.
#[derive(Debug, Clone, Copy)]
pub struct Ignored;

/// Role a parameter plays in request building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParamRole {
    #[default]
    Unassigned,
    Placeholder,
    Body,
    QueryMap,
    Ignored,
}

/// The validated, immutable product of parsing one method.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    config_key: String,
    method_name: String,
    template: RequestTemplate,
    /// Placeholder names each argument position feeds.
    bindings: Vec<Vec<String>>,
    /// Argument positions whose values arrive pre-encoded.
    encoded: Vec<bool>,
    roles: Vec<ParamRole>,
    body_index: Option<usize>,
    query_map_index: Option<usize>,
    result: ResultType,
    warnings: Vec<String>,
}

impl MethodDescriptor {
    fn new(config_key: String, method_name: String, param_count: usize, result: ResultType) -> Self {
        MethodDescriptor {
            config_key,
            method_name,
            template: RequestTemplate::new(),
            bindings: vec![Vec::new(); param_count],
            encoded: vec![false; param_count],
            roles: vec![ParamRole::Unassigned; param_count],
            body_index: None,
            query_map_index: None,
            result,
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn config_key(&self) -> &str {
        &self.config_key
    }

    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    #[must_use]
    pub fn template(&self) -> &RequestTemplate {
        &self.template
    }

    /// Mutable access for marker handlers during parsing.
    pub fn template_mut(&mut self) -> &mut RequestTemplate {
        &mut self.template
    }

    #[must_use]
    pub fn bindings(&self) -> &[Vec<String>] {
        &self.bindings
    }

    #[must_use]
    pub fn is_pre_encoded(&self, index: usize) -> bool {
        self.encoded.get(index).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn body_index(&self) -> Option<usize> {
        self.body_index
    }

    #[must_use]
    pub fn query_map_index(&self) -> Option<usize> {
        self.query_map_index
    }

    #[must_use]
    pub fn is_ignored(&self, index: usize) -> bool {
        matches!(self.roles.get(index), Some(ParamRole::Ignored))
    }

    #[must_use]
    pub fn result(&self) -> &ResultType {
        &self.result
    }

    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Binds argument `index` to placeholder `name`.
    pub fn bind_param(&mut self, index: usize, name: &str, encoded: bool) -> Result<(), ContractError> {
        match self.roles[index] {
            ParamRole::Unassigned | ParamRole::Placeholder => {}
            _ => return self.role_conflict(index),
        }
        self.roles[index] = ParamRole::Placeholder;
        if !self.bindings[index].iter().any(|n| n == name) {
            self.bindings[index].push(name.to_owned());
        }
        if encoded {
            self.encoded[index] = true;
        }
        Ok(())
    }

    /// Marks argument `index` as the request body.
    pub fn set_body(&mut self, index: usize) -> Result<(), ContractError> {
        if self.roles[index] != ParamRole::Unassigned {
            return self.role_conflict(index);
        }
        if self.body_index.is_some() {
            return Err(ContractError::TooManyBodyParams {
                key: self.config_key.clone(),
            });
        }
        self.roles[index] = ParamRole::Body;
        self.body_index = Some(index);
        Ok(())
    }

    /// Marks argument `index` as a query map.
    pub fn set_query_map(&mut self, index: usize) -> Result<(), ContractError> {
        if self.roles[index] != ParamRole::Unassigned || self.query_map_index.is_some() {
            return self.role_conflict(index);
        }
        self.roles[index] = ParamRole::QueryMap;
        self.query_map_index = Some(index);
        Ok(())
    }

    /// Excludes argument `index` from request building.
    pub fn set_ignored(&mut self, index: usize) -> Result<(), ContractError> {
        if self.roles[index] != ParamRole::Unassigned {
            return self.role_conflict(index);
        }
        self.roles[index] = ParamRole::Ignored;
        Ok(())
    }

    fn role_conflict(&self, index: usize) -> Result<(), ContractError> {
        Err(ContractError::ConflictingRoles {
            key: self.config_key.clone(),
            index,
        })
    }
}

/// Parses API descriptions into method descriptors.
pub trait Contract: Send + Sync {
    fn parse(&self, api: &ApiDescription) -> Result<Arc<Vec<MethodDescriptor>>, ContractError>;
}

type TypeHandler =
    Box<dyn Fn(&dyn Any, &mut MethodDescriptor) -> Result<(), ContractError> + Send + Sync>;
type ParamHandler =
    Box<dyn Fn(&dyn Any, &mut MethodDescriptor, usize) -> Result<(), ContractError> + Send + Sync>;

/// Marker-dialect contract with handler registries keyed by marker type.
///
/// Parse results are cached per description instance, so building several
/// clients against the same description pays the parse cost once.
pub struct DeclarativeContract {
    on_type: HashMap<TypeId, TypeHandler>,
    on_method: HashMap<TypeId, TypeHandler>,
    on_param: HashMap<TypeId, ParamHandler>,
    cache: DashMap<u64, Arc<Vec<MethodDescriptor>>>,
}

impl Default for DeclarativeContract {
    fn default() -> Self {
        let mut contract = Self::empty();
        contract.register_builtin_markers();
        contract
    }
}

impl DeclarativeContract {
    /// A contract with no registered markers. Useful for fully custom
    /// dialects; most callers want [`DeclarativeContract::default`].
    #[must_use]
    pub fn empty() -> Self {
        DeclarativeContract {
            on_type: HashMap::new(),
            on_method: HashMap::new(),
            on_param: HashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Registers a handler for API-level markers of type `M`.
    pub fn register_on_type<M, F>(&mut self, handler: F)
    where
        M: Any,
        F: Fn(&M, &mut MethodDescriptor) -> Result<(), ContractError> + Send + Sync + 'static,
    {
        self.on_type.insert(
            TypeId::of::<M>(),
            Box::new(move |marker, descriptor| match marker.downcast_ref::<M>() {
                Some(marker) => handler(marker, descriptor),
                None => Ok(()),
            }),
        );
    }

    /// Registers a handler for method-level markers of type `M`.
    pub fn register_on_method<M, F>(&mut self, handler: F)
    where
        M: Any,
        F: Fn(&M, &mut MethodDescriptor) -> Result<(), ContractError> + Send + Sync + 'static,
    {
        self.on_method.insert(
            TypeId::of::<M>(),
            Box::new(move |marker, descriptor| match marker.downcast_ref::<M>() {
                Some(marker) => handler(marker, descriptor),
                None => Ok(()),
            }),
        );
    }

    /// Registers a handler for parameter-level markers of type `M`.
    pub fn register_on_param<M, F>(&mut self, handler: F)
    where
        M: Any,
        F: Fn(&M, &mut MethodDescriptor, usize) -> Result<(), ContractError>
            + Send
            + Sync
            + 'static,
    {
        self.on_param.insert(
            TypeId::of::<M>(),
            Box::new(
                move |marker, descriptor, index| match marker.downcast_ref::<M>() {
                    Some(marker) => handler(marker, descriptor, index),
                    None => Ok(()),
                },
            ),
        );
    }

    fn register_builtin_markers(&mut self) {
        self.register_on_method::<RequestLine, _>(|line, descriptor| {
            if descriptor.template.method().is_some() {
                return Err(ContractError::DuplicateVerb {
                    key: descriptor.config_key.clone(),
                });
            }
            descriptor
                .template
                .set_method(line.method.clone())
                .set_encode_slash(line.encode_slash)
                .set_collection_format(line.collection_format)
                .append_path(&line.path);
            Ok(())
        });

        let header_lines = |lines: &HeaderLines,
                            descriptor: &mut MethodDescriptor|
         -> Result<(), ContractError> {
            for line in &lines.0 {
                let (name, value) =
                    line.split_once(':')
                        .ok_or_else(|| ContractError::InvalidHeaderLine {
                            line: line.clone(),
                        })?;
                let (name, value) = (name.trim(), value.trim());
                if name.is_empty() {
                    return Err(ContractError::InvalidHeaderLine { line: line.clone() });
                }
                if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("accept")
                {
                    descriptor.template.replace_header(name, value);
                } else {
                    descriptor.template.header(name, value);
                }
            }
            Ok(())
        };
        self.register_on_type::<HeaderLines, _>(header_lines);
        self.register_on_method::<HeaderLines, _>(header_lines);

        self.register_on_method::<BodyTemplate, _>(|body, descriptor| {
            descriptor.template.body_template(&body.0);
            Ok(())
        });

        self.register_on_param::<Param, _>(|param, descriptor, index| {
            descriptor.bind_param(index, &param.name, param.encoded)
        });
        self.register_on_param::<BodyParam, _>(|_, descriptor, index| descriptor.set_body(index));
        self.register_on_param::<QueryMapParam, _>(|_, descriptor, index| {
            descriptor.set_query_map(index)
        });
        self.register_on_param::<Ignored, _>(|_, descriptor, index| descriptor.set_ignored(index));
    }

    fn parse_method(
        &self,
        api: &ApiDescription,
        method: &MethodDescription,
    ) -> Result<MethodDescriptor, ContractError> {
        let param_names: Vec<&str> = method.params.iter().map(|p| p.name.as_str()).collect();
        let config_key = format!("{}#{}({})", api.name, method.name, param_names.join(","));
        let mut descriptor = MethodDescriptor::new(
            config_key,
            method.name.clone(),
            method.params.len(),
            method.result.clone(),
        );

        for marker in &api.markers {
            let id = (**marker).type_id();
            match self.on_type.get(&id) {
                Some(handler) => handler(marker.as_ref(), &mut descriptor)?,
                None => descriptor.add_warning("unhandled API-level marker".to_owned()),
            }
        }
        for marker in &method.markers {
            let id = (**marker).type_id();
            match self.on_method.get(&id) {
                Some(handler) => handler(marker.as_ref(), &mut descriptor)?,
                None => descriptor.add_warning("unhandled method-level marker".to_owned()),
            }
        }
        if descriptor.template.method().is_none() {
            return Err(ContractError::MissingVerb {
                key: descriptor.config_key,
            });
        }

        for (index, param) in method.params.iter().enumerate() {
            if param.markers.is_empty() {
                // An unmarked parameter is the body by convention.
                descriptor.set_body(index)?;
                continue;
            }
            for marker in &param.markers {
                let id = (**marker).type_id();
                match self.on_param.get(&id) {
                    Some(handler) => handler(marker.as_ref(), &mut descriptor, index)?,
                    None => descriptor.add_warning(format!(
                        "unhandled marker on parameter '{}'",
                        param.name
                    )),
                }
            }
        }

        self.validate_bindings(&descriptor, &param_names)?;

        for warning in &descriptor.warnings {
            tracing::warn!(
                config_key = %descriptor.config_key,
                warning = %warning,
                "contract warning"
            );
        }
        Ok(descriptor)
    }

    /// Bidirectional placeholder check: every placeholder needs a bound
    /// argument, every binding needs a referencing placeholder.
    fn validate_bindings(
        &self,
        descriptor: &MethodDescriptor,
        param_names: &[&str],
    ) -> Result<(), ContractError> {
        let placeholders = descriptor.template.variables();
        for name in &placeholders {
            let bound = descriptor.bindings.iter().any(|b| b.iter().any(|n| n == name));
            if !bound {
                return Err(ContractError::UnboundPlaceholder {
                    key: descriptor.config_key.clone(),
                    name: name.clone(),
                });
            }
        }
        for (index, bindings) in descriptor.bindings.iter().enumerate() {
            for name in bindings {
                if !placeholders.iter().any(|p| p == name) {
                    return Err(ContractError::UnreferencedBinding {
                        key: descriptor.config_key.clone(),
                        param: param_names.get(index).map_or("?", |n| n).to_owned(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn parse_uncached(&self, api: &ApiDescription) -> Result<Arc<Vec<MethodDescriptor>>, ContractError> {
        let mut descriptors: Vec<MethodDescriptor> = Vec::with_capacity(api.methods.len());
        for method in &api.methods {
            let descriptor = self.parse_method(api, method)?;
            if descriptors
                .iter()
                .any(|d| d.config_key == descriptor.config_key)
            {
                return Err(ContractError::DuplicateKey {
                    key: descriptor.config_key,
                });
            }
            if descriptors
                .iter()
                .any(|d| d.method_name == descriptor.method_name)
            {
                return Err(ContractError::DuplicateMethod {
                    name: descriptor.method_name,
                });
            }
            descriptors.push(descriptor);
        }
        Ok(Arc::new(descriptors))
    }
}

impl Contract for DeclarativeContract {
    fn parse(&self, api: &ApiDescription) -> Result<Arc<Vec<MethodDescriptor>>, ContractError> {
        if let Some(cached) = self.cache.get(&api.id) {
            return Ok(Arc::clone(&cached));
        }
        let parsed = self.parse_uncached(api)?;
        self.cache.insert(api.id, Arc::clone(&parsed));
        Ok(parsed)
    }
}
