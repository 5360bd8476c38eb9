//! REST/JSON transcoding: path templates, the compiled matcher, and
//! request/response body mapping.

pub mod matcher;
pub mod template;

pub(crate) mod body;

pub use matcher::{BindingSource, PathMatch, PathMatcher, PathMatcherBuilder, VariableBinding};
pub use template::{HttpTemplate, Segment, TemplateError, VariableSegment};
