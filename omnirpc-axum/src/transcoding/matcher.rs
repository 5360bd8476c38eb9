//! Compiled path matcher for the transcoding surface.
//!
//! A [`PathMatcherBuilder`] collects (verb, template) → method entries at
//! registration time and rejects ambiguous bindings when built; the
//! resulting [`PathMatcher`] is immutable and shared read-only while
//! serving. Lookup is a pure function of (verb, path, query).

use std::collections::HashMap;

use super::template::{FlatTemplate, HttpTemplate, TemplateError};

/// Where a variable binding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    Path,
    Query,
}

/// One extracted variable: a dotted field path and its string value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    pub field_path: Vec<String>,
    pub value: String,
    pub source: BindingSource,
}

struct MatchEntry {
    verb: http::Method,
    template: HttpTemplate,
    flat: FlatTemplate,
    literal_count: usize,
    method_path: String,
    body: Option<String>,
    response_body: Option<String>,
}

/// A successful lookup: the target method plus everything needed to
/// assemble the request and project the response.
#[derive(Debug, Clone)]
pub struct PathMatch {
    /// Canonical method path of the bound RPC.
    pub method_path: String,
    pub bindings: Vec<VariableBinding>,
    pub body: Option<String>,
    pub response_body: Option<String>,
}

/// Accumulates bindings; [`build`](Self::build) fails fast on ambiguity.
#[derive(Default)]
pub struct PathMatcherBuilder {
    entries: Vec<MatchEntry>,
}

impl PathMatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one (verb, template) → method entry.
    pub fn register(
        &mut self,
        verb: http::Method,
        path: &str,
        body: Option<String>,
        response_body: Option<String>,
        method_path: &str,
    ) -> Result<(), TemplateError> {
        let template = HttpTemplate::parse(path)?;
        let flat = template.flatten();
        let literal_count = template.literal_count();
        self.entries.push(MatchEntry {
            verb,
            template,
            flat,
            literal_count,
            method_path: method_path.to_string(),
            body,
            response_body,
        });
        Ok(())
    }

    /// Compile the matcher. Two entries for the same verb that can match
    /// the same path with equal literal specificity are a configuration
    /// error, not a runtime tie to break heuristically.
    pub fn build(self) -> Result<PathMatcher, TemplateError> {
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                if a.verb == b.verb
                    && a.literal_count == b.literal_count
                    && a.flat.overlaps(&b.flat)
                {
                    return Err(TemplateError::Ambiguous(
                        a.template.raw().to_string(),
                        b.template.raw().to_string(),
                    ));
                }
            }
        }
        Ok(PathMatcher {
            entries: self.entries,
        })
    }
}

/// Immutable compiled collection of path bindings.
pub struct PathMatcher {
    entries: Vec<MatchEntry>,
}

impl PathMatcher {
    /// Resolve a (verb, path, query) triple to at most one method.
    ///
    /// When several templates match, the one with more literal segments
    /// wins; exact ties were rejected at build time.
    pub fn lookup(&self, verb: &http::Method, path: &str, query: Option<&str>) -> Option<PathMatch> {
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let (entry, captures) = self
            .entries
            .iter()
            .filter(|e| e.verb == *verb)
            .filter_map(|e| e.template.match_path(&segments).map(|c| (e, c)))
            .max_by_key(|(e, _)| e.literal_count)?;

        let mut bindings: Vec<VariableBinding> = captures
            .into_iter()
            .map(|(var, value)| VariableBinding {
                field_path: var.field_path,
                value,
                source: BindingSource::Path,
            })
            .collect();

        bindings.extend(query_bindings(query, entry.body.as_deref()));

        Some(PathMatch {
            method_path: entry.method_path.clone(),
            bindings,
            body: entry.body.clone(),
            response_body: entry.response_body.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Convert query parameters into variable bindings.
///
/// With a `*` body selector every field arrives in the body, so no query
/// binding is produced; with a named selector, only that key is skipped.
fn query_bindings(query: Option<&str>, body: Option<&str>) -> Vec<VariableBinding> {
    let Some(query) = query else {
        return Vec::new();
    };
    if body == Some("*") {
        return Vec::new();
    }

    let params: HashMap<String, String> = match serde_qs::from_str(query) {
        Ok(params) => params,
        Err(err) => {
            tracing::debug!(target: "omnirpc", %err, "ignoring unparseable query string");
            return Vec::new();
        }
    };

    let mut bindings: Vec<VariableBinding> = params
        .into_iter()
        .filter(|(key, _)| body != Some(key.as_str()))
        .map(|(key, value)| VariableBinding {
            field_path: key.split('.').map(str::to_string).collect(),
            value,
            source: BindingSource::Query,
        })
        .collect();
    // HashMap iteration order is arbitrary; keep lookups deterministic.
    bindings.sort_by(|a, b| a.field_path.cmp(&b.field_path));
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(entries: &[(&str, &str, &str)]) -> PathMatcher {
        let mut builder = PathMatcherBuilder::new();
        for (verb, path, method) in entries {
            builder
                .register(
                    verb.parse().unwrap(),
                    path,
                    None,
                    None,
                    method,
                )
                .unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_lookup_extracts_variables() {
        let matcher = matcher(&[(
            "GET",
            "/v1/shelves/{shelf}/books/{book}",
            "/library.Books/GetBook",
        )]);

        let m = matcher
            .lookup(&http::Method::GET, "/v1/shelves/5/books/harry-potter", None)
            .unwrap();
        assert_eq!(m.method_path, "/library.Books/GetBook");
        assert_eq!(m.bindings.len(), 2);
        assert_eq!(m.bindings[0].field_path, vec!["shelf"]);
        assert_eq!(m.bindings[0].value, "5");
        assert_eq!(m.bindings[0].source, BindingSource::Path);
        assert_eq!(m.bindings[1].field_path, vec!["book"]);
        assert_eq!(m.bindings[1].value, "harry-potter");
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let matcher = matcher(&[
            ("GET", "/v1/shelves/{shelf}", "/library.Shelves/Get"),
            ("GET", "/v1/shelves/featured", "/library.Shelves/Featured"),
        ]);

        for _ in 0..3 {
            let m = matcher
                .lookup(&http::Method::GET, "/v1/shelves/featured", None)
                .unwrap();
            assert_eq!(m.method_path, "/library.Shelves/Featured");

            let m = matcher
                .lookup(&http::Method::GET, "/v1/shelves/42", None)
                .unwrap();
            assert_eq!(m.method_path, "/library.Shelves/Get");
        }
    }

    #[test]
    fn test_lookup_respects_verb() {
        let matcher = matcher(&[("GET", "/v1/shelves/{shelf}", "/library.Shelves/Get")]);
        assert!(
            matcher
                .lookup(&http::Method::DELETE, "/v1/shelves/5", None)
                .is_none()
        );
    }

    #[test]
    fn test_ambiguous_bindings_rejected_at_build() {
        let mut builder = PathMatcherBuilder::new();
        builder
            .register(
                http::Method::GET,
                "/v1/shelves/{shelf}",
                None,
                None,
                "/library.Shelves/Get",
            )
            .unwrap();
        builder
            .register(
                http::Method::GET,
                "/v1/shelves/*",
                None,
                None,
                "/library.Shelves/Other",
            )
            .unwrap();

        assert!(matches!(
            builder.build(),
            Err(TemplateError::Ambiguous(_, _))
        ));
    }

    #[test]
    fn test_same_template_different_verbs_allowed() {
        let mut builder = PathMatcherBuilder::new();
        builder
            .register(
                http::Method::GET,
                "/v1/shelves/{shelf}",
                None,
                None,
                "/library.Shelves/Get",
            )
            .unwrap();
        builder
            .register(
                http::Method::DELETE,
                "/v1/shelves/{shelf}",
                None,
                None,
                "/library.Shelves/Delete",
            )
            .unwrap();
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_query_parameters_become_bindings() {
        let matcher = matcher(&[("GET", "/v1/books", "/library.Books/List")]);

        let m = matcher
            .lookup(
                &http::Method::GET,
                "/v1/books",
                Some("page_size=10&filter.author=rowling"),
            )
            .unwrap();

        assert_eq!(m.bindings.len(), 2);
        assert_eq!(m.bindings[0].field_path, vec!["filter", "author"]);
        assert_eq!(m.bindings[0].value, "rowling");
        assert_eq!(m.bindings[0].source, BindingSource::Query);
        assert_eq!(m.bindings[1].field_path, vec!["page_size"]);
    }

    #[test]
    fn test_query_key_matching_body_selector_is_skipped() {
        let mut builder = PathMatcherBuilder::new();
        builder
            .register(
                http::Method::POST,
                "/v1/books",
                Some("book".to_string()),
                None,
                "/library.Books/Create",
            )
            .unwrap();
        let matcher = builder.build().unwrap();

        let m = matcher
            .lookup(&http::Method::POST, "/v1/books", Some("book=x&shelf=5"))
            .unwrap();
        assert_eq!(m.bindings.len(), 1);
        assert_eq!(m.bindings[0].field_path, vec!["shelf"]);
    }

    #[test]
    fn test_star_body_selector_suppresses_query_bindings() {
        let mut builder = PathMatcherBuilder::new();
        builder
            .register(
                http::Method::POST,
                "/v1/books",
                Some("*".to_string()),
                None,
                "/library.Books/Create",
            )
            .unwrap();
        let matcher = builder.build().unwrap();

        let m = matcher
            .lookup(&http::Method::POST, "/v1/books", Some("shelf=5"))
            .unwrap();
        assert!(m.bindings.is_empty());
    }
}
