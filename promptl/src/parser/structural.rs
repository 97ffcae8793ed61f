use std::ops::Range;

use crate::code::ErrorCode;
use crate::expression::Expression;
use crate::expression::Statement;
use crate::node::attribute::{self, Attribute, AttributeValue};
use crate::node::{ContentKind, MessageRole, Node, NodeKind, Nodes};
use crate::parser::error::ParseError;
use crate::parser::expression::{
    parse_expression, parse_for_header, parse_statement, parse_template_string, scan_mustache_end,
};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Split off a leading `---` YAML block. Returns the config and the byte offset where the body starts.
pub(crate) fn parse_frontmatter(
    source: &str,
    file_id: usize,
) -> Result<(Option<serde_json::Value>, usize), ParseError> {
    let Some(after_open) = source
        .strip_prefix("---\n")
        .or_else(|| source.strip_prefix("---\r\n"))
    else {
        return Ok((None, 0));
    };
    let open_len = source.len() - after_open.len();

    // The closing delimiter is either at the very start of the block or after a newline.
    let close = if after_open.starts_with("---") {
        Some(0)
    } else {
        after_open.find("\n---").map(|p| p + 1)
    };
    let Some(close) = close else {
        return Err(ParseError::new(
            ErrorCode::InvalidConfig,
            "missing closing --- frontmatter delimiter",
            0..3,
            file_id,
        ));
    };

    let yaml = &after_open[..close];
    let mut body_start = open_len + close + 3;
    let rest = &source[body_start..];
    if let Some(stripped) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
        body_start += rest.len() - stripped.len();
    }

    let config = if yaml.trim().is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_yaml::from_str::<serde_json::Value>(yaml).map_err(|e| {
            ParseError::new(
                ErrorCode::InvalidConfig,
                format!("invalid frontmatter config: {}", e),
                open_len..open_len + close,
                file_id,
            )
        })?
    };
    Ok((Some(config), body_start))
}

/// Parse template text starting at `start` into a node tree.
pub(crate) fn parse_nodes(source: &str, start: usize, file_id: usize) -> Result<Nodes, ParseError> {
    let mut state = ParseState::new(source, start, file_id);
    state.process()?;
    state.finalize()
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum TagName {
    Message(Option<MessageRole>),
    Content(ContentKind),
    Step,
    Prompt,
}

/// Tags that stay open for children. `<prompt>` is always self-closing and becomes a reference.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ContainerTag {
    Message(Option<MessageRole>),
    Content(ContentKind),
    Step,
}

impl TagName {
    fn container(self) -> Option<ContainerTag> {
        match self {
            TagName::Message(role) => Some(ContainerTag::Message(role)),
            TagName::Content(kind) => Some(ContainerTag::Content(kind)),
            TagName::Step => Some(ContainerTag::Step),
            TagName::Prompt => None,
        }
    }
}

fn tag_name(name: &str) -> Option<TagName> {
    Some(match name {
        "system" => TagName::Message(Some(MessageRole::System)),
        "user" => TagName::Message(Some(MessageRole::User)),
        "assistant" => TagName::Message(Some(MessageRole::Assistant)),
        "tool" => TagName::Message(Some(MessageRole::Tool)),
        "message" => TagName::Message(None),
        "content-text" => TagName::Content(ContentKind::Text),
        "content-image" => TagName::Content(ContentKind::Image),
        "content-file" => TagName::Content(ContentKind::File),
        "tool-call" => TagName::Content(ContentKind::ToolCall),
        "step" => TagName::Step,
        "prompt" => TagName::Prompt,
        _ => return None,
    })
}

/// Attributes a tag cannot do without.
fn required_attributes(tag: TagName) -> &'static [&'static str] {
    match tag {
        TagName::Message(None) => &["role"],
        TagName::Message(Some(MessageRole::Tool)) => &["id"],
        TagName::Content(ContentKind::File) => &["mime"],
        TagName::Content(ContentKind::ToolCall) => &["id", "name"],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Parse state
// ---------------------------------------------------------------------------

struct ParseState<'a> {
    source: &'a str,
    file_id: usize,
    pos: usize,
    /// Pending literal text and where it started.
    text: String,
    text_start: usize,
    /// Stack of nodes being built. Innermost = current container.
    stack: Vec<Builder>,
}

struct Builder {
    kind: BuilderKind,
    children: Vec<Node>,
    /// Span of the opening tag or `{{ }}` block header.
    open_span: Range<usize>,
}

enum BuilderKind {
    Root,
    Tag {
        tag: ContainerTag,
        name: String,
        attributes: Vec<Attribute>,
    },
    ForLoop {
        binding: String,
        index: Option<String>,
        iterable: Expression,
        /// Set once `{{ else }}` is reached; `children` then holds the else branch.
        body: Option<Vec<Node>>,
    },
    Conditional {
        condition: Expression,
        /// Set once `{{ else }}` or `{{ else if }}` is reached.
        then: Option<Vec<Node>>,
        /// Opened by `{{ else if }}`: closes together with its parent at `{{ endif }}`.
        chained: bool,
    },
}

impl<'a> ParseState<'a> {
    fn new(source: &'a str, start: usize, file_id: usize) -> Self {
        ParseState {
            source,
            file_id,
            pos: start,
            text: String::new(),
            text_start: start,
            stack: vec![Builder {
                kind: BuilderKind::Root,
                children: Vec::new(),
                open_span: start..start,
            }],
        }
    }

    fn error(&self, code: ErrorCode, message: impl Into<String>, span: Range<usize>) -> ParseError {
        ParseError::new(code, message, span, self.file_id)
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn process(&mut self) -> Result<(), ParseError> {
        while self.pos < self.source.len() {
            let rest = self.rest();
            if rest.starts_with("\\{{") {
                self.push_text("{{", 3);
            } else if rest.starts_with("\\<") {
                self.push_text("<", 2);
            } else if rest.starts_with("/*") {
                self.skip_comment()?;
            } else if rest.starts_with("{{") {
                self.flush_text();
                self.process_mustache()?;
            } else if let Some((closing, name, tag)) = self.peek_tag() {
                self.flush_text();
                if closing {
                    self.process_closing_tag(name, tag)?;
                } else {
                    self.process_opening_tag(name, tag)?;
                }
            } else {
                let Some(c) = rest.chars().next() else { break };
                let mut buf = [0u8; 4];
                self.push_text(c.encode_utf8(&mut buf), c.len_utf8());
            }
        }
        self.flush_text();
        Ok(())
    }

    fn finalize(mut self) -> Result<Nodes, ParseError> {
        if self.stack.len() > 1
            && let Some(open) = self.stack.pop()
        {
            return Err(match open.kind {
                BuilderKind::Tag { name, .. } => self.error(
                    ErrorCode::UnclosedTag,
                    format!("<{}> is never closed", name),
                    open.open_span,
                ),
                BuilderKind::ForLoop { .. } => self.error(
                    ErrorCode::UnclosedBlock,
                    "for loop is missing {{ endfor }}",
                    open.open_span,
                ),
                _ => self.error(
                    ErrorCode::UnclosedBlock,
                    "if block is missing {{ endif }}",
                    open.open_span,
                ),
            });
        }
        let root = self.stack.pop().map(|b| b.children).unwrap_or_default();
        Ok(root.into())
    }

    // ------------------------------------------------------------------
    // Text and comments
    // ------------------------------------------------------------------

    fn push_text(&mut self, s: &str, consumed: usize) {
        if self.text.is_empty() {
            self.text_start = self.pos;
        }
        self.text.push_str(s);
        self.pos += consumed;
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let span = self.text_start..self.pos;
        self.push_node(Node::new(NodeKind::Text(text), span));
    }

    fn skip_comment(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        match self.rest()[2..].find("*/") {
            Some(end) => {
                self.pos += 2 + end + 2;
                Ok(())
            }
            None => Err(self.error(
                ErrorCode::UnclosedComment,
                "comment is never closed with */",
                start..self.source.len(),
            )),
        }
    }

    fn push_node(&mut self, node: Node) {
        if let Some(top) = self.stack.last_mut() {
            top.children.push(node);
        }
    }

    // ------------------------------------------------------------------
    // Mustache: {{ expr }}, {{ x = expr }}, block keywords
    // ------------------------------------------------------------------

    fn process_mustache(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let end = scan_mustache_end(self.source, start + 2).ok_or_else(|| {
            self.error(
                ErrorCode::UnclosedMustache,
                "'{{' is never closed with '}}'",
                start..self.source.len(),
            )
        })?;
        self.pos = end + 2;
        let span = start..self.pos;

        let source = self.source;
        let raw = &source[start + 2..end];
        let leading = raw.len() - raw.trim_start().len();
        let inner = raw.trim();
        let inner_offset = start + 2 + leading;

        let keyword_len = inner
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
            .unwrap_or(inner.len());
        let keyword = &inner[..keyword_len];
        let args_raw = &inner[keyword_len..];
        let args = args_raw.trim_start();
        let args_offset = inner_offset + keyword_len + (args_raw.len() - args.len());

        match keyword {
            "for" => {
                let (binding, index, iterable) = parse_for_header(args, args_offset, self.file_id)?;
                self.stack.push(Builder {
                    kind: BuilderKind::ForLoop {
                        binding,
                        index,
                        iterable,
                        body: None,
                    },
                    children: Vec::new(),
                    open_span: span,
                });
            }
            "if" => {
                let condition = parse_expression(args, args_offset, self.file_id)?;
                self.stack.push(Builder {
                    kind: BuilderKind::Conditional {
                        condition,
                        then: None,
                        chained: false,
                    },
                    children: Vec::new(),
                    open_span: span,
                });
            }
            "else" => {
                let if_len = args
                    .find(|c: char| !c.is_alphanumeric())
                    .unwrap_or(args.len());
                if args.is_empty() {
                    self.process_else(span)?;
                } else if &args[..if_len] == "if" {
                    let cond_raw = &args[if_len..];
                    let cond = cond_raw.trim_start();
                    let cond_offset = args_offset + if_len + (cond_raw.len() - cond.len());
                    let condition = parse_expression(cond, cond_offset, self.file_id)?;
                    self.process_else_if(condition, span)?;
                } else {
                    return Err(self.error(
                        ErrorCode::UnexpectedToken,
                        "expected {{ else }} or {{ else if condition }}",
                        span,
                    ));
                }
            }
            "endfor" | "endif" => {
                if !args.is_empty() {
                    return Err(self.error(
                        ErrorCode::UnexpectedToken,
                        format!("unexpected text after {}", keyword),
                        span,
                    ));
                }
                if keyword == "endfor" {
                    self.close_for(span)?;
                } else {
                    self.close_if(span)?;
                }
            }
            _ => {
                let node = match parse_statement(inner, inner_offset, self.file_id)? {
                    Statement::Assignment {
                        target,
                        operator,
                        value,
                    } => NodeKind::Assignment {
                        target,
                        operator,
                        value,
                    },
                    Statement::Expression(expr) => NodeKind::Mustache(expr),
                };
                self.push_node(Node::new(node, span));
            }
        }
        Ok(())
    }

    /// Error for a block keyword that does not match the innermost open construct.
    fn block_mismatch(&self, keyword: &str, span: Range<usize>) -> ParseError {
        match self.stack.last().map(|b| (&b.kind, b.open_span.clone())) {
            Some((BuilderKind::Tag { name, .. }, open)) => self
                .error(
                    ErrorCode::UnclosedTag,
                    format!("<{}> must be closed before {}", name, keyword),
                    open,
                )
                .with_note(format!("{} found at byte {}", keyword, span.start)),
            _ => self.error(
                ErrorCode::UnexpectedBlockKeyword,
                format!("{} without a matching block", keyword),
                span,
            ),
        }
    }

    fn process_else(&mut self, span: Range<usize>) -> Result<(), ParseError> {
        let mismatch = self.block_mismatch("{{ else }}", span);
        let Some(top) = self.stack.last_mut() else {
            return Err(mismatch);
        };
        let children = &mut top.children;
        match &mut top.kind {
            BuilderKind::ForLoop { body: body @ None, .. } => {
                *body = Some(std::mem::take(children));
                Ok(())
            }
            BuilderKind::Conditional { then: then @ None, .. } => {
                *then = Some(std::mem::take(children));
                Ok(())
            }
            _ => Err(mismatch),
        }
    }

    fn process_else_if(&mut self, condition: Expression, span: Range<usize>) -> Result<(), ParseError> {
        let mismatch = self.block_mismatch("{{ else if }}", span.clone());
        let Some(top) = self.stack.last_mut() else {
            return Err(mismatch);
        };
        let children = &mut top.children;
        match &mut top.kind {
            BuilderKind::Conditional { then: then @ None, .. } => {
                *then = Some(std::mem::take(children));
            }
            _ => return Err(mismatch),
        }
        self.stack.push(Builder {
            kind: BuilderKind::Conditional {
                condition,
                then: None,
                chained: true,
            },
            children: Vec::new(),
            open_span: span,
        });
        Ok(())
    }

    fn close_for(&mut self, span: Range<usize>) -> Result<(), ParseError> {
        let (binding, index, iterable, body, children, open_span) = match self.stack.pop() {
            Some(Builder {
                kind:
                    BuilderKind::ForLoop {
                        binding,
                        index,
                        iterable,
                        body,
                    },
                children,
                open_span,
            }) => (binding, index, iterable, body, children, open_span),
            other => {
                self.stack.extend(other);
                return Err(self.block_mismatch("{{ endfor }}", span));
            }
        };
        let (body, otherwise) = match body {
            Some(body) => (body, children),
            None => (children, Vec::new()),
        };
        self.push_node(Node::new(
            NodeKind::ForLoop {
                binding,
                index,
                iterable,
                body: body.into(),
                otherwise: otherwise.into(),
            },
            open_span.start..span.end,
        ));
        Ok(())
    }

    fn close_if(&mut self, span: Range<usize>) -> Result<(), ParseError> {
        loop {
            let (condition, then, chained, children, open_span) = match self.stack.pop() {
                Some(Builder {
                    kind:
                        BuilderKind::Conditional {
                            condition,
                            then,
                            chained,
                        },
                    children,
                    open_span,
                }) => (condition, then, chained, children, open_span),
                other => {
                    self.stack.extend(other);
                    return Err(self.block_mismatch("{{ endif }}", span));
                }
            };
            let (then, otherwise) = match then {
                Some(then) => (then, children),
                None => (children, Vec::new()),
            };
            self.push_node(Node::new(
                NodeKind::Conditional {
                    condition,
                    then: then.into(),
                    otherwise: otherwise.into(),
                },
                open_span.start..span.end,
            ));
            if !chained {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// If the input is at a known `<tag` or `</tag`, return (closing, name, tag).
    fn peek_tag(&self) -> Option<(bool, &'a str, TagName)> {
        let rest = self.rest();
        let after = rest.strip_prefix('<')?;
        let (closing, after) = match after.strip_prefix('/') {
            Some(a) => (true, a),
            None => (false, after),
        };
        let name_len = after
            .find(|c: char| !(c.is_ascii_lowercase() || c == '-'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        let next = after[name_len..].chars().next();
        let boundary = matches!(next, Some(c) if c.is_whitespace() || c == '>' || c == '/');
        if !boundary {
            return None;
        }
        tag_name(name).map(|tag| (closing, name, tag))
    }

    fn process_opening_tag(&mut self, name: &str, tag: TagName) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1 + name.len();
        let (attributes, self_closing) = self.parse_attributes(start, name)?;
        let span = start..self.pos;
        self.check_nesting(tag, span.clone())?;

        for required in required_attributes(tag) {
            if attribute::find(&attributes, required).is_none() {
                return Err(self.error(
                    ErrorCode::MissingTagAttribute,
                    format!("<{}> requires a '{}' attribute", name, required),
                    span,
                ));
            }
        }

        let Some(container) = tag.container() else {
            if !self_closing {
                return Err(self.error(
                    ErrorCode::ReferenceTagNotSelfClosing,
                    "<prompt> tags must be self-closing: <prompt path=\"..\" />",
                    span,
                ));
            }
            let node = self.build_reference(attributes, span)?;
            self.push_node(node);
            return Ok(());
        };

        if self_closing {
            self.push_node(build_tag_node(container, attributes, Vec::new(), span));
        } else {
            self.stack.push(Builder {
                kind: BuilderKind::Tag {
                    tag: container,
                    name: name.to_string(),
                    attributes,
                },
                children: Vec::new(),
                open_span: span,
            });
        }
        Ok(())
    }

    fn process_closing_tag(&mut self, name: &str, tag: TagName) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 2 + name.len();
        let ws = self.rest().len() - self.rest().trim_start().len();
        self.pos += ws;
        if !self.rest().starts_with('>') {
            return Err(self.error(
                ErrorCode::UnexpectedToken,
                format!("expected '>' to close </{}", name),
                start..self.pos,
            ));
        }
        self.pos += 1;
        let span = start..self.pos;

        let Some(top) = self.stack.last() else {
            return Err(self.error(ErrorCode::UnexpectedClosingTag, "unexpected closing tag", span));
        };
        match &top.kind {
            BuilderKind::Tag { tag: open, .. } if Some(*open) == tag.container() => {}
            BuilderKind::Tag { name: open_name, .. } => {
                return Err(self
                    .error(
                        ErrorCode::UnexpectedClosingTag,
                        format!("expected </{}>, found </{}>", open_name, name),
                        span,
                    )
                    .with_note(format!("<{}> opened at byte {}", open_name, top.open_span.start)));
            }
            BuilderKind::ForLoop { .. } | BuilderKind::Conditional { .. } => {
                return Err(self.error(
                    ErrorCode::UnclosedBlock,
                    format!("block must be closed before </{}>", name),
                    top.open_span.clone(),
                ));
            }
            BuilderKind::Root => {
                return Err(self.error(
                    ErrorCode::UnexpectedClosingTag,
                    format!("</{}> has no matching opening tag", name),
                    span,
                ));
            }
        }

        if let Some(Builder {
            kind: BuilderKind::Tag { tag, attributes, .. },
            children,
            open_span,
        }) = self.stack.pop()
        {
            self.push_node(build_tag_node(tag, attributes, children, open_span.start..span.end));
        }
        Ok(())
    }

    /// Enforce the tag nesting rules against every open tag.
    fn check_nesting(&self, tag: TagName, span: Range<usize>) -> Result<(), ParseError> {
        for builder in self.stack.iter().rev() {
            let BuilderKind::Tag { tag: open, name, .. } = &builder.kind else {
                continue;
            };
            let violation = match (tag, open) {
                (TagName::Message(_), ContainerTag::Message(_)) => Some((
                    ErrorCode::MessageTagInsideMessage,
                    "message tags cannot be nested",
                )),
                (TagName::Step, ContainerTag::Step) => {
                    Some((ErrorCode::StepTagInsideStep, "step tags cannot be nested"))
                }
                (TagName::Step, ContainerTag::Message(_)) => Some((
                    ErrorCode::StepTagInsideMessage,
                    "step tags cannot appear inside a message",
                )),
                (TagName::Content(_), ContainerTag::Content(_)) => Some((
                    ErrorCode::ContentTagInsideContent,
                    "content tags cannot be nested",
                )),
                (TagName::Message(_) | TagName::Step | TagName::Prompt, ContainerTag::Content(_)) => {
                    Some((
                        ErrorCode::InvalidTagNesting,
                        "content tags may only contain text and expressions",
                    ))
                }
                _ => None,
            };
            if let Some((code, message)) = violation {
                return Err(self
                    .error(code, message, span)
                    .with_note(format!("inside <{}> opened at byte {}", name, builder.open_span.start)));
            }
        }
        Ok(())
    }

    fn build_reference(&self, attributes: Vec<Attribute>, span: Range<usize>) -> Result<Node, ParseError> {
        let mut path = None;
        let mut rest = Vec::with_capacity(attributes.len());
        for attr in attributes {
            if attr.name != "path" {
                rest.push(attr);
                continue;
            }
            match &attr.value {
                AttributeValue::Text(ts) => match ts.as_literal() {
                    Some(p) if !p.trim().is_empty() => path = Some(p.trim().to_string()),
                    _ => {
                        return Err(self.error(
                            ErrorCode::InvalidReferencePath,
                            "reference paths must be non-empty static strings",
                            attr.span.clone(),
                        ));
                    }
                },
                _ => {
                    return Err(self.error(
                        ErrorCode::InvalidReferencePath,
                        "reference paths must be non-empty static strings",
                        attr.span.clone(),
                    ));
                }
            }
        }
        let path = path.ok_or_else(|| {
            self.error(
                ErrorCode::ReferenceTagWithoutPath,
                "<prompt> requires a 'path' attribute",
                span.clone(),
            )
        })?;
        Ok(Node::new(
            NodeKind::Reference {
                path,
                attributes: rest,
            },
            span,
        ))
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Parse attributes up to `>` or `/>`. Returns (attributes, self_closing).
    fn parse_attributes(&mut self, tag_start: usize, tag: &str) -> Result<(Vec<Attribute>, bool), ParseError> {
        let mut attributes: Vec<Attribute> = Vec::new();
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.error(
                    ErrorCode::UnclosedTag,
                    format!("<{} is never closed with '>'", tag),
                    tag_start..self.source.len(),
                ));
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok((attributes, true));
            }
            if rest.starts_with('>') {
                self.pos += 1;
                return Ok((attributes, false));
            }

            let attr_start = self.pos;
            let name_len = rest
                .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')))
                .unwrap_or(rest.len());
            if name_len == 0 {
                return Err(self.error(
                    ErrorCode::InvalidTagAttribute,
                    format!("unexpected character in <{}> tag", tag),
                    attr_start..attr_start + 1,
                ));
            }
            let name = rest[..name_len].to_string();
            self.pos += name_len;

            self.skip_whitespace();
            let value = if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                self.parse_attribute_value(tag)?
            } else {
                AttributeValue::Flag
            };

            let span = attr_start..self.pos;
            if attribute::find(&attributes, &name).is_some() {
                return Err(self.error(
                    ErrorCode::InvalidTagAttribute,
                    format!("duplicate attribute '{}'", name),
                    span,
                ));
            }
            attributes.push(Attribute { name, value, span });
        }
    }

    fn parse_attribute_value(&mut self, tag: &str) -> Result<AttributeValue, ParseError> {
        let start = self.pos;
        let rest = self.rest();

        if rest.starts_with("{{") {
            let end = scan_mustache_end(self.source, start + 2).ok_or_else(|| {
                self.error(
                    ErrorCode::UnclosedMustache,
                    "'{{' is never closed with '}}'",
                    start..self.source.len(),
                )
            })?;
            let expr = parse_expression(&self.source[start + 2..end], start + 2, self.file_id)?;
            self.pos = end + 2;
            return Ok(AttributeValue::Expression(expr));
        }

        let quote = match rest.chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => {
                return Err(self.error(
                    ErrorCode::InvalidTagAttribute,
                    format!("attribute values in <{}> must be quoted or wrapped in {{{{ }}}}", tag),
                    start..start + 1,
                ));
            }
        };

        // Find the closing quote, skipping over embedded {{ }} expressions.
        let mut i = start + 1;
        let end = loop {
            let Some(c) = self.source[i..].chars().next() else {
                return Err(self.error(
                    ErrorCode::UnclosedTag,
                    "unterminated attribute value",
                    start..self.source.len(),
                ));
            };
            if self.source[i..].starts_with("{{") {
                match scan_mustache_end(self.source, i + 2) {
                    Some(e) => i = e + 2,
                    None => {
                        return Err(self.error(
                            ErrorCode::UnclosedMustache,
                            "'{{' is never closed with '}}'",
                            i..self.source.len(),
                        ));
                    }
                }
                continue;
            }
            if c == quote {
                break i;
            }
            i += c.len_utf8();
        };

        let text = parse_template_string(&self.source[start + 1..end], start + 1, self.file_id)?;
        self.pos = end + 1;
        Ok(AttributeValue::Text(text))
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }
}

fn build_tag_node(tag: ContainerTag, attributes: Vec<Attribute>, children: Vec<Node>, span: Range<usize>) -> Node {
    let kind = match tag {
        ContainerTag::Message(role) => NodeKind::MessageTag {
            role,
            attributes,
            children: children.into(),
        },
        ContainerTag::Content(kind) => NodeKind::ContentTag {
            kind,
            attributes,
            children: children.into(),
        },
        ContainerTag::Step => NodeKind::Step {
            attributes,
            children: children.into(),
        },
    };
    Node::new(kind, span)
}
