pub mod attribute;

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expression::{AssignmentOperator, Expression};
use crate::node::attribute::Attribute;

/// A shared, immutable list of sibling nodes.
///
/// Children are reference counted so an evaluator can hold a cursor into any
/// subtree without borrowing the whole template.
pub type Nodes = Arc<[Node]>;

/// Role of a message in the produced conversation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Kind of a content tag inside (or outside) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// `<content-text>`
    Text,
    /// `<content-image>`
    Image,
    /// `<content-file mime="..">`
    File,
    /// `<tool-call id=".." name=".." arguments={{ .. }} />`
    ToolCall,
}

/// A single node of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// Byte span in source for error reporting.
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal text.
    Text(String),
    /// `<system>`, `<user>`, `<assistant>`, `<tool>`, or `<message role="..">`.
    /// `role` is `None` for `<message>`, whose role comes from its attribute at run time.
    MessageTag {
        role: Option<MessageRole>,
        attributes: Vec<Attribute>,
        children: Nodes,
    },
    /// `<content-*>` and `<tool-call>` tags.
    ContentTag {
        kind: ContentKind,
        attributes: Vec<Attribute>,
        children: Nodes,
    },
    /// `{{ expr }}`
    Mustache(Expression),
    /// `{{ target = expr }}`
    Assignment {
        target: String,
        operator: AssignmentOperator,
        value: Expression,
    },
    /// `{{ for binding[, index] in iterable }} body {{ else }} otherwise {{ endfor }}`
    ForLoop {
        binding: String,
        index: Option<String>,
        iterable: Expression,
        body: Nodes,
        otherwise: Nodes,
    },
    /// `{{ if condition }} then {{ else }} otherwise {{ endif }}`
    Conditional {
        condition: Expression,
        then: Nodes,
        otherwise: Nodes,
    },
    /// `<prompt path=".." attr=".." />`
    Reference {
        path: String,
        attributes: Vec<Attribute>,
    },
    /// `<step>...</step>`
    Step {
        attributes: Vec<Attribute>,
        children: Nodes,
    },
}

impl Node {
    pub fn new(kind: NodeKind, span: Range<usize>) -> Self {
        Node { kind, span }
    }

    /// Short human-readable name of the node kind, for logs and `--ast` output.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Text(_) => "text",
            NodeKind::MessageTag { .. } => "message",
            NodeKind::ContentTag { .. } => "content",
            NodeKind::Mustache(_) => "mustache",
            NodeKind::Assignment { .. } => "assignment",
            NodeKind::ForLoop { .. } => "for",
            NodeKind::Conditional { .. } => "if",
            NodeKind::Reference { .. } => "prompt",
            NodeKind::Step { .. } => "step",
        }
    }
}
