//! HTTP path template parsing.
//!
//! Templates follow the `google.api.http` grammar: literal segments,
//! single-segment wildcards (`*`), a trailing multi-segment wildcard
//! (`**`), and named variables (`{name}` or `{name=shelves/*}`). Variable
//! names may be dotted to address nested request fields.

use std::collections::HashSet;

/// Invalid or ambiguous template configuration. Fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template must start with '/': {0}")]
    MissingSlash(String),

    #[error("template has no segments")]
    Empty,

    #[error("'**' must be the final segment")]
    DeepWildcardNotLast,

    #[error("duplicate variable name: {0}")]
    DuplicateVariable(String),

    #[error("malformed segment: {0}")]
    MalformedSegment(String),

    #[error("ambiguous bindings: '{0}' and '{1}' match the same paths")]
    Ambiguous(String, String),
}

/// One segment of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*`: exactly one path segment of any content.
    Wildcard,
    /// `**`: all remaining path segments (possibly none). Final only.
    DeepWildcard,
    /// `{name}` or `{name=pattern}`: binds matched segments to a field.
    Variable(VariableSegment),
}

/// A named variable and the sub-pattern it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSegment {
    /// The declared (possibly dotted) name.
    pub name: String,
    /// The dotted name split into a field path.
    pub field_path: Vec<String>,
    /// The captured pattern; defaults to a single `*`.
    pub pattern: Vec<Segment>,
}

/// A parsed path template. Built once when a service binds; immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl HttpTemplate {
    /// Parse a template string.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let Some(rest) = template.strip_prefix('/') else {
            return Err(TemplateError::MissingSlash(template.to_string()));
        };
        if rest.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut segments = Vec::new();
        let mut names = HashSet::new();

        for part in rest.split('/') {
            segments.push(parse_segment(part, &mut names)?);
        }

        // `**` is only allowed in final position, including when it is the
        // last element of a variable's capture pattern.
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if segment_reaches_end(segment) && i != last {
                return Err(TemplateError::DeepWildcardNotLast);
            }
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// The original template string.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of literal segments, counting literals inside variable
    /// capture patterns. Used for match preference.
    pub fn literal_count(&self) -> usize {
        fn count(segments: &[Segment]) -> usize {
            segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(_) => 1,
                    Segment::Variable(v) => count(&v.pattern),
                    _ => 0,
                })
                .sum()
        }
        count(&self.segments)
    }

    /// Match a split path against this template, producing the variable
    /// captures in declaration order. `None` if the path does not match.
    pub fn match_path(&self, path: &[&str]) -> Option<Vec<(VariableSegment, String)>> {
        let mut captures = Vec::new();
        if match_segments(&self.segments, path, &mut captures) {
            Some(captures)
        } else {
            None
        }
    }

    /// Flattened shape used for build-time overlap detection.
    pub(crate) fn flatten(&self) -> FlatTemplate {
        let mut fixed = Vec::new();
        let mut open_tail = false;

        fn flatten_into(segments: &[Segment], fixed: &mut Vec<FlatSegment>, open_tail: &mut bool) {
            for segment in segments {
                match segment {
                    Segment::Literal(s) => fixed.push(FlatSegment::Literal(s.clone())),
                    Segment::Wildcard => fixed.push(FlatSegment::Any),
                    Segment::DeepWildcard => *open_tail = true,
                    Segment::Variable(v) => flatten_into(&v.pattern, fixed, open_tail),
                }
            }
        }

        flatten_into(&self.segments, &mut fixed, &mut open_tail);
        FlatTemplate { fixed, open_tail }
    }
}

fn parse_segment(part: &str, names: &mut HashSet<String>) -> Result<Segment, TemplateError> {
    match part {
        "" => Err(TemplateError::MalformedSegment("//".to_string())),
        "*" => Ok(Segment::Wildcard),
        "**" => Ok(Segment::DeepWildcard),
        _ if part.starts_with('{') => {
            let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) else {
                return Err(TemplateError::MalformedSegment(part.to_string()));
            };

            let (name, pattern) = match inner.split_once('=') {
                None => (inner, vec![Segment::Wildcard]),
                Some((name, sub)) => {
                    let mut pattern = Vec::new();
                    for sub_part in sub.split('/') {
                        // Nested variables are not part of the grammar.
                        match sub_part {
                            "" => {
                                return Err(TemplateError::MalformedSegment(part.to_string()));
                            }
                            "*" => pattern.push(Segment::Wildcard),
                            "**" => pattern.push(Segment::DeepWildcard),
                            _ if sub_part.starts_with('{') => {
                                return Err(TemplateError::MalformedSegment(part.to_string()));
                            }
                            _ => pattern.push(Segment::Literal(sub_part.to_string())),
                        }
                    }
                    // `**` inside a pattern must also be its last element.
                    if pattern[..pattern.len() - 1]
                        .iter()
                        .any(|s| *s == Segment::DeepWildcard)
                    {
                        return Err(TemplateError::DeepWildcardNotLast);
                    }
                    (name, pattern)
                }
            };

            if name.is_empty() {
                return Err(TemplateError::MalformedSegment(part.to_string()));
            }
            if !names.insert(name.to_string()) {
                return Err(TemplateError::DuplicateVariable(name.to_string()));
            }

            Ok(Segment::Variable(VariableSegment {
                name: name.to_string(),
                field_path: name.split('.').map(str::to_string).collect(),
                pattern,
            }))
        }
        _ if part.contains('}') => Err(TemplateError::MalformedSegment(part.to_string())),
        _ => Ok(Segment::Literal(part.to_string())),
    }
}

/// Whether this segment consumes everything to the end of the path.
fn segment_reaches_end(segment: &Segment) -> bool {
    match segment {
        Segment::DeepWildcard => true,
        Segment::Variable(v) => matches!(v.pattern.last(), Some(Segment::DeepWildcard)),
        _ => false,
    }
}

fn match_segments<'p>(
    pattern: &[Segment],
    path: &[&'p str],
    captures: &mut Vec<(VariableSegment, String)>,
) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Literal(lit)) => match path.first() {
            Some(head) if head == lit => match_segments(&pattern[1..], &path[1..], captures),
            _ => false,
        },
        Some(Segment::Wildcard) => {
            !path.is_empty() && match_segments(&pattern[1..], &path[1..], captures)
        }
        Some(Segment::DeepWildcard) => true,
        Some(Segment::Variable(var)) => {
            let consumed = if matches!(var.pattern.last(), Some(Segment::DeepWildcard)) {
                // Open-ended capture: the fixed prefix must match, the rest
                // belongs to the variable.
                let prefix = &var.pattern[..var.pattern.len() - 1];
                if path.len() < prefix.len() {
                    return false;
                }
                if !match_fixed(prefix, &path[..prefix.len()]) {
                    return false;
                }
                path.len()
            } else {
                let len = var.pattern.len();
                if path.len() < len || !match_fixed(&var.pattern, &path[..len]) {
                    return false;
                }
                len
            };

            // Record the capture in declaration order; undo on backtrack.
            captures.push((var.clone(), path[..consumed].join("/")));
            if match_segments(&pattern[1..], &path[consumed..], captures) {
                true
            } else {
                captures.pop();
                false
            }
        }
    }
}

/// Match a variable's fixed-length capture pattern (literals and `*` only).
fn match_fixed(pattern: &[Segment], path: &[&str]) -> bool {
    pattern.iter().zip(path).all(|(p, seg)| match p {
        Segment::Literal(lit) => lit == seg,
        Segment::Wildcard => true,
        _ => false,
    })
}

/// Flattened template shape for overlap detection.
#[derive(Debug, Clone)]
pub(crate) struct FlatTemplate {
    fixed: Vec<FlatSegment>,
    /// Whether the template ends in a multi-segment wildcard.
    open_tail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FlatSegment {
    Literal(String),
    Any,
}

impl FlatTemplate {
    /// Conservative overlap test: whether some literal path matches both
    /// templates.
    pub fn overlaps(&self, other: &FlatTemplate) -> bool {
        let common = self.fixed.len().min(other.fixed.len());
        for (a, b) in self.fixed[..common].iter().zip(&other.fixed[..common]) {
            if let (FlatSegment::Literal(x), FlatSegment::Literal(y)) = (a, b) {
                if x != y {
                    return false;
                }
            }
        }

        if self.fixed.len() == other.fixed.len() {
            return true;
        }
        // The shorter template can only cover the longer one's paths when
        // it ends in a multi-segment wildcard.
        if self.fixed.len() < other.fixed.len() {
            self.open_tail
        } else {
            other.open_tail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals_and_wildcards() {
        let tmpl = HttpTemplate::parse("/v1/shelves/*/books/**").unwrap();
        assert_eq!(tmpl.segments().len(), 5);
        assert_eq!(tmpl.literal_count(), 3);
    }

    #[test]
    fn test_parse_variables() {
        let tmpl = HttpTemplate::parse("/v1/shelves/{shelf}/books/{book.id}").unwrap();
        let Segment::Variable(var) = &tmpl.segments()[2] else {
            panic!("expected variable segment");
        };
        assert_eq!(var.name, "shelf");
        assert_eq!(var.field_path, vec!["shelf"]);

        let Segment::Variable(var) = &tmpl.segments()[4] else {
            panic!("expected variable segment");
        };
        assert_eq!(var.field_path, vec!["book", "id"]);
    }

    #[test]
    fn test_parse_variable_with_pattern() {
        let tmpl = HttpTemplate::parse("/v1/{name=shelves/*}/books").unwrap();
        let Segment::Variable(var) = &tmpl.segments()[1] else {
            panic!("expected variable segment");
        };
        assert_eq!(
            var.pattern,
            vec![
                Segment::Literal("shelves".to_string()),
                Segment::Wildcard,
            ]
        );
    }

    #[test]
    fn test_parse_rejects_non_final_deep_wildcard() {
        assert_eq!(
            HttpTemplate::parse("/v1/**/books"),
            Err(TemplateError::DeepWildcardNotLast)
        );
        assert_eq!(
            HttpTemplate::parse("/v1/{name=a/**/b}"),
            Err(TemplateError::DeepWildcardNotLast)
        );
        assert_eq!(
            HttpTemplate::parse("/v1/{name=**}/tail"),
            Err(TemplateError::DeepWildcardNotLast)
        );
    }

    #[test]
    fn test_parse_rejects_duplicate_variable() {
        assert_eq!(
            HttpTemplate::parse("/v1/{name}/x/{name}"),
            Err(TemplateError::DuplicateVariable("name".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(HttpTemplate::parse("v1/no-slash").is_err());
        assert!(HttpTemplate::parse("/").is_err());
        assert!(HttpTemplate::parse("/v1/{unclosed").is_err());
        assert!(HttpTemplate::parse("/v1/{}").is_err());
        assert!(HttpTemplate::parse("/v1//double").is_err());
    }

    #[test]
    fn test_match_literal_and_variables() {
        let tmpl = HttpTemplate::parse("/v1/shelves/{shelf}/books/{book}").unwrap();
        let captures = tmpl
            .match_path(&["v1", "shelves", "5", "books", "harry-potter"])
            .unwrap();

        let values: Vec<(&str, &str)> = captures
            .iter()
            .map(|(v, s)| (v.name.as_str(), s.as_str()))
            .collect();
        assert!(values.contains(&("shelf", "5")));
        assert!(values.contains(&("book", "harry-potter")));

        assert!(tmpl.match_path(&["v1", "shelves", "5"]).is_none());
        assert!(
            tmpl.match_path(&["v2", "shelves", "5", "books", "x"])
                .is_none()
        );
    }

    #[test]
    fn test_match_variable_with_pattern_captures_all_segments() {
        let tmpl = HttpTemplate::parse("/v1/{name=shelves/*}").unwrap();
        let captures = tmpl.match_path(&["v1", "shelves", "42"]).unwrap();
        assert_eq!(captures[0].1, "shelves/42");

        assert!(tmpl.match_path(&["v1", "drawers", "42"]).is_none());
    }

    #[test]
    fn test_match_deep_wildcard_consumes_rest() {
        let tmpl = HttpTemplate::parse("/files/**").unwrap();
        assert!(tmpl.match_path(&["files", "a", "b", "c"]).is_some());
        assert!(tmpl.match_path(&["files"]).is_some());

        let tmpl = HttpTemplate::parse("/files/{path=**}").unwrap();
        let captures = tmpl.match_path(&["files", "a", "b"]).unwrap();
        assert_eq!(captures[0].1, "a/b");
    }

    #[test]
    fn test_overlap_detection() {
        let a = HttpTemplate::parse("/v1/shelves/{shelf}").unwrap().flatten();
        let b = HttpTemplate::parse("/v1/shelves/*").unwrap().flatten();
        let c = HttpTemplate::parse("/v1/books/{book}").unwrap().flatten();
        let d = HttpTemplate::parse("/v1/**").unwrap().flatten();

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(d.overlaps(&a));
        assert!(d.overlaps(&c));
    }
}
