//! Routes and route signatures.
//!
//! A [`Route`] is a method plus a path template such as
//! `/channels/{channel_id}/messages` with concrete parameter values. Its
//! [`RouteSignature`] keeps only the method and template, so calls against
//! different resource ids of the same template share rate-limit state until
//! the server reports a bucket key.

use std::fmt;

use reqwest::Method;

/// Normalized `(method, path template)` key for rate-limit lookups.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteSignature {
    method: Method,
    template: String,
}

impl RouteSignature {
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl fmt::Display for RouteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// Errors produced while resolving a route template.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route {template} is missing parameter {name}")]
    MissingParameter { template: String, name: String },

    #[error("route {template} has an unterminated parameter")]
    Unterminated { template: String },
}

/// A concrete API route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: String,
    params: Vec<(String, String)>,
}

impl Route {
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            params: Vec::new(),
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn put(template: impl Into<String>) -> Self {
        Self::new(Method::PUT, template)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(Method::DELETE, template)
    }

    /// Binds a value for `{name}` in the template.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn signature(&self) -> RouteSignature {
        RouteSignature::new(self.method.clone(), self.template.clone())
    }

    /// Substitutes every `{name}` placeholder with its percent-encoded value.
    pub fn path(&self) -> Result<String, RouteError> {
        let mut path = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find('{') {
            path.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('}').ok_or_else(|| RouteError::Unterminated {
                template: self.template.clone(),
            })?;
            let name = &after[..end];
            let value = self
                .params
                .iter()
                .find(|(param, _)| param == name)
                .map(|(_, value)| value)
                .ok_or_else(|| RouteError::MissingParameter {
                    template: self.template.clone(),
                    name: name.to_string(),
                })?;
            path.push_str(&urlencoding::encode(value));
            rest = &after[end + 1..];
        }
        path.push_str(rest);

        Ok(path)
    }
}
