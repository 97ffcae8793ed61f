pub mod error;
pub mod expression;
mod structural;

pub use error::ParseError;

use crate::Template;

/// Parser entry point.
pub struct Parser {
    source: String,
    file_id: usize,
}

impl Parser {
    pub fn new(source: impl Into<String>, file_id: usize) -> Self {
        Parser {
            source: source.into(),
            file_id,
        }
    }

    /// Parse the template text into a node tree. Performs no I/O.
    pub fn parse(&self) -> Result<Template, ParseError> {
        let (config, body_start) = structural::parse_frontmatter(&self.source, self.file_id)?;
        let nodes = structural::parse_nodes(&self.source, body_start, self.file_id)?;
        Ok(Template {
            nodes,
            config,
            source_id: self.file_id,
        })
    }
}
