pub mod code;
pub mod expression;
pub mod node;
pub mod parser;

pub use code::ErrorCode;
pub use node::{MessageRole, Node, NodeKind, Nodes};
pub use parser::{ParseError, Parser};

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    /// Top-level nodes in document order.
    pub nodes: Nodes,
    /// Frontmatter config (`---` YAML block), as JSON.
    pub config: Option<serde_json::Value>,
    /// The source file ID (for error reporting with codespan-reporting).
    pub source_id: usize,
}

impl Template {
    /// True if the template contains at least one `<step>` tag, at any depth.
    pub fn has_steps(&self) -> bool {
        fn walk(nodes: &[Node]) -> bool {
            nodes.iter().any(|node| match &node.kind {
                NodeKind::Step { .. } => true,
                NodeKind::MessageTag { children, .. } | NodeKind::ContentTag { children, .. } => {
                    walk(children)
                }
                NodeKind::ForLoop {
                    body, otherwise, ..
                } => walk(body) || walk(otherwise),
                NodeKind::Conditional {
                    then, otherwise, ..
                } => walk(then) || walk(otherwise),
                _ => false,
            })
        }
        walk(&self.nodes)
    }

    /// Static reference paths (`<prompt path="..">`) in document order, at any depth.
    pub fn reference_paths(&self) -> Vec<&str> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a str>) {
            for node in nodes {
                match &node.kind {
                    NodeKind::Reference { path, .. } => out.push(path),
                    NodeKind::MessageTag { children, .. }
                    | NodeKind::ContentTag { children, .. }
                    | NodeKind::Step { children, .. } => walk(children, out),
                    NodeKind::ForLoop {
                        body, otherwise, ..
                    } => {
                        walk(body, out);
                        walk(otherwise, out);
                    }
                    NodeKind::Conditional {
                        then, otherwise, ..
                    } => {
                        walk(then, out);
                        walk(otherwise, out);
                    }
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }
}
