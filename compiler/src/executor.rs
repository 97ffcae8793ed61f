use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use promptl::node::attribute::Attribute;
use promptl::node::{ContentKind, MessageRole, Node, NodeKind, Nodes};
use promptl::{ErrorCode, Template};
use tracing::{debug, trace};

use crate::error::{CompileError, RuntimeError, SpannedError};
use crate::evaluator::{assign, eval_attributes, evaluate};
use crate::message::{Content, Message};
use crate::resolver::{ReferenceFn, ReferenceResolver};
use crate::scope::{ScopeId, Scopes};
use crate::value::Value;

/// Cooperative cancellation flag, checked between node evaluations.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The end of a `<step>` was reached; the caller owes a response.
    Paused { step_index: usize },
    Completed,
}

/// One entry of the explicit work stack. The innermost entry is on top.
enum Frame {
    /// Walk `nodes` from `cursor`.
    Nodes {
        nodes: Nodes,
        cursor: usize,
        scope: ScopeId,
        /// `scope` was created for these nodes and is released when they finish.
        owns_scope: bool,
        /// Path of the document these nodes belong to.
        source: Option<Arc<str>>,
    },
    /// Remaining iterations of a for loop: (item, index or key) pairs.
    Loop {
        binding: String,
        index: Option<String>,
        items: Vec<(Value, Value)>,
        next: usize,
        body: Nodes,
        scope: ScopeId,
        source: Option<Arc<str>>,
    },
    CloseMessage,
    CloseContent,
    CloseStep {
        as_var: Option<String>,
        raw_var: Option<String>,
        scope: ScopeId,
    },
    CloseReference,
}

/// Text and content gathered for one message.
#[derive(Debug, Default)]
struct ContentBuffer {
    content: Vec<Content>,
    text: String,
}

impl ContentBuffer {
    fn flush_text(&mut self) {
        let text = self.text.trim();
        if !text.is_empty() {
            self.content.push(Content::Text {
                text: text.to_string(),
            });
        }
        self.text.clear();
    }

    fn finish(mut self) -> Vec<Content> {
        self.flush_text();
        self.content
    }
}

struct OpenMessage {
    role: MessageRole,
    attributes: HashMap<String, Value>,
    buffer: ContentBuffer,
}

struct OpenContent {
    kind: ContentKind,
    attributes: HashMap<String, Value>,
    text: String,
}

/// Bindings requested by the `<step>` the chain is paused at.
struct PendingStep {
    as_var: Option<String>,
    raw_var: Option<String>,
    scope: ScopeId,
}

/// Everything a compile needs between pauses. Owned by exactly one chain or render.
pub(crate) struct ChainState {
    frames: Vec<Frame>,
    scopes: Scopes,
    conversation: Vec<Message>,
    step_count: usize,
    resolver: ReferenceResolver,
    /// Text and content outside any message tag, flushed as a system message.
    loose: ContentBuffer,
    message: Option<OpenMessage>,
    content: Option<OpenContent>,
    in_step: bool,
    pending_step: Option<PendingStep>,
    /// Paths of the references currently being evaluated, outermost first.
    references: Vec<Arc<str>>,
    root_path: Option<Arc<str>>,
    /// False for single-shot renders, where step tags are transparent.
    pause_at_steps: bool,
    abort: AbortHandle,
}

impl ChainState {
    pub fn new(
        template: &Template,
        parameters: HashMap<String, Value>,
        reference_fn: Option<Arc<dyn ReferenceFn>>,
        full_path: Option<&str>,
        pause_at_steps: bool,
        abort: AbortHandle,
    ) -> Self {
        let mut scopes = Scopes::new();
        let root = scopes.root(parameters);
        let root_path: Option<Arc<str>> = full_path.map(Arc::from);
        ChainState {
            frames: vec![Frame::Nodes {
                nodes: template.nodes.clone(),
                cursor: 0,
                scope: root,
                owns_scope: false,
                source: root_path.clone(),
            }],
            scopes,
            conversation: Vec::new(),
            step_count: 0,
            resolver: ReferenceResolver::new(reference_fn),
            loose: ContentBuffer::default(),
            message: None,
            content: None,
            in_step: false,
            pending_step: None,
            references: Vec::new(),
            root_path,
            pause_at_steps,
            abort,
        }
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn into_conversation(self) -> Vec<Message> {
        self.conversation
    }

    /// Append the caller's responses to the step we are paused at and bind `as` / `raw`.
    pub fn resume(&mut self, responses: Vec<Message>) {
        if let Some(PendingStep {
            as_var,
            raw_var,
            scope,
        }) = self.pending_step.take()
        {
            let last = responses.last();
            if let Some(name) = as_var {
                let text = last.map(Message::text_content).unwrap_or_default();
                self.scopes.assign(scope, &name, Value::String(text));
            }
            if let Some(name) = raw_var {
                let raw = last
                    .and_then(|m| serde_json::to_value(m).ok())
                    .map(Value::from)
                    .unwrap_or_default();
                self.scopes.assign(scope, &name, raw);
            }
        }
        self.conversation.extend(responses);
    }

    /// Evaluate until the next step boundary or the end of the document.
    pub async fn run(&mut self) -> Result<Outcome, CompileError> {
        loop {
            if self.abort.is_aborted() {
                return Err(CompileError::new(ErrorCode::ChainAborted, "chain was aborted"));
            }
            let Some(frame) = self.frames.last_mut() else {
                self.flush_loose();
                trace!(scopes = self.scopes.live(), "document finished");
                return Ok(Outcome::Completed);
            };
            match frame {
                Frame::Nodes {
                    nodes,
                    cursor,
                    scope,
                    owns_scope,
                    source,
                } => {
                    if *cursor >= nodes.len() {
                        let (scope, owned) = (*scope, *owns_scope);
                        self.frames.pop();
                        if owned {
                            self.scopes.release(scope);
                        }
                        continue;
                    }
                    let nodes = nodes.clone();
                    let index = *cursor;
                    *cursor += 1;
                    let (scope, source) = (*scope, source.clone());
                    self.eval_node(&nodes[index], scope, source).await?;
                }
                Frame::Loop { .. } => self.next_iteration(),
                _ => {
                    if let Some(outcome) = self.close_frame() {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn eval_node(&mut self, node: &Node, scope: ScopeId, source: Option<Arc<str>>) -> Result<(), CompileError> {
        trace!(kind = node.kind_name(), span = ?node.span, "eval node");
        let path = source.as_deref();
        let fail = |e: SpannedError| CompileError::runtime(e, &node.span, path);

        match &node.kind {
            NodeKind::Text(text) => self.write_text(text),

            NodeKind::Mustache(expr) => {
                let value = evaluate(expr, &self.scopes, scope).map_err(fail)?;
                self.write_text(&value.to_string());
            }

            NodeKind::Assignment {
                target,
                operator,
                value,
            } => assign(target, *operator, value, &mut self.scopes, scope).map_err(fail)?,

            NodeKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let branch = if evaluate(condition, &self.scopes, scope).map_err(fail)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                self.push_block(branch, scope, &source);
            }

            NodeKind::ForLoop {
                binding,
                index,
                iterable,
                body,
                otherwise,
            } => {
                let items: Vec<(Value, Value)> = match evaluate(iterable, &self.scopes, scope).map_err(fail)? {
                    Value::Array(items) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| (item, Value::Number(i as f64)))
                        .collect(),
                    Value::Object(map) => map.into_iter().map(|(k, v)| (v, Value::String(k))).collect(),
                    other => {
                        return Err(fail(RuntimeError::InvalidIterable(other.type_name().to_string()).into()));
                    }
                };
                if items.is_empty() {
                    self.push_block(otherwise, scope, &source);
                } else {
                    self.frames.push(Frame::Loop {
                        binding: binding.clone(),
                        index: index.clone(),
                        items,
                        next: 0,
                        body: body.clone(),
                        scope,
                        source,
                    });
                }
            }

            NodeKind::MessageTag {
                role,
                attributes,
                children,
            } => self.open_message(*role, attributes, children, &node.span, scope, source)?,

            NodeKind::ContentTag {
                kind,
                attributes,
                children,
            } => self.open_content(*kind, attributes, children, &node.span, scope, source)?,

            NodeKind::Step { attributes, children } => {
                self.open_step(attributes, children, &node.span, scope, source)?
            }

            NodeKind::Reference {
                path: reference,
                attributes,
            } => self.enter_reference(reference, attributes, &node.span, scope, source).await?,
        }
        Ok(())
    }

    /// Walk a conditional branch or loop `else` in a nested scope.
    fn push_block(&mut self, nodes: &Nodes, parent: ScopeId, source: &Option<Arc<str>>) {
        if nodes.is_empty() {
            return;
        }
        let scope = self.scopes.child(parent);
        self.frames.push(Frame::Nodes {
            nodes: nodes.clone(),
            cursor: 0,
            scope,
            owns_scope: true,
            source: source.clone(),
        });
    }

    fn next_iteration(&mut self) {
        let Some(Frame::Loop {
            binding,
            index,
            items,
            next,
            body,
            scope,
            source,
        }) = self.frames.last_mut()
        else {
            return;
        };
        if *next >= items.len() {
            self.frames.pop();
            return;
        }
        let (item, key) = items[*next].clone();
        *next += 1;
        let binding = binding.clone();
        let index = index.clone();
        let body = body.clone();
        let parent = *scope;
        let source = source.clone();

        let child = self.scopes.child(parent);
        self.scopes.declare(child, binding, item);
        if let Some(index) = index {
            self.scopes.declare(child, index, key);
        }
        self.frames.push(Frame::Nodes {
            nodes: body,
            cursor: 0,
            scope: child,
            owns_scope: true,
            source,
        });
    }

    fn close_frame(&mut self) -> Option<Outcome> {
        match self.frames.pop() {
            Some(Frame::CloseMessage) => self.close_message(),
            Some(Frame::CloseContent) => self.close_content(),
            Some(Frame::CloseStep {
                as_var,
                raw_var,
                scope,
            }) => {
                self.in_step = false;
                self.flush_loose();
                let step_index = self.step_count;
                self.step_count += 1;
                if self.pause_at_steps {
                    debug!(step_index, messages = self.conversation.len(), "paused at step");
                    self.pending_step = Some(PendingStep {
                        as_var,
                        raw_var,
                        scope,
                    });
                    return Some(Outcome::Paused { step_index });
                }
            }
            Some(Frame::CloseReference) => {
                if let Some(path) = self.references.pop() {
                    debug!(path = %path, "left reference");
                }
            }
            _ => {}
        }
        None
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    fn write_text(&mut self, text: &str) {
        if let Some(content) = &mut self.content {
            content.text.push_str(text);
        } else if let Some(message) = &mut self.message {
            message.buffer.text.push_str(text);
        } else {
            self.loose.text.push_str(text);
        }
    }

    fn flush_loose(&mut self) {
        let content = std::mem::take(&mut self.loose).finish();
        if !content.is_empty() {
            self.conversation.push(Message {
                role: MessageRole::System,
                content,
            });
        }
    }

    fn open_message(
        &mut self,
        role: Option<MessageRole>,
        attributes: &[Attribute],
        children: &Nodes,
        span: &Range<usize>,
        scope: ScopeId,
        source: Option<Arc<str>>,
    ) -> Result<(), CompileError> {
        let path = source.as_deref();
        if self.message.is_some() {
            return Err(CompileError::new(
                ErrorCode::MessageTagInsideMessage,
                "message tags cannot be nested",
            )
            .with_span(span.clone())
            .with_source_path(path)
            .with_note("a referenced document opened a message inside the including document's message"));
        }
        if self.content.is_some() {
            return Err(nesting_error(
                ErrorCode::InvalidTagNesting,
                "content tags may only contain text and expressions",
                span,
                path,
            ));
        }

        let mut attributes = eval_attributes(attributes, &self.scopes, scope)
            .map_err(|e| CompileError::runtime(e, span, path))?;
        let role = match role {
            Some(role) => role,
            None => {
                let raw = attributes.remove("role").unwrap_or_default();
                match raw.as_str().and_then(|s| s.parse::<MessageRole>().ok()) {
                    Some(role) => role,
                    None => {
                        let err = RuntimeError::InvalidMessageRole(raw.to_string());
                        return Err(CompileError::runtime(err.into(), span, path));
                    }
                }
            }
        };

        self.flush_loose();
        self.message = Some(OpenMessage {
            role,
            attributes,
            buffer: ContentBuffer::default(),
        });
        self.frames.push(Frame::CloseMessage);
        self.frames.push(Frame::Nodes {
            nodes: children.clone(),
            cursor: 0,
            scope,
            owns_scope: false,
            source,
        });
        Ok(())
    }

    fn close_message(&mut self) {
        let Some(OpenMessage {
            role,
            attributes,
            buffer,
        }) = self.message.take()
        else {
            return;
        };
        let mut content = buffer.finish();
        if role == MessageRole::Tool {
            let result = Message {
                role,
                content: std::mem::take(&mut content),
            }
            .text_content();
            content.push(Content::ToolResult {
                tool_call_id: string_attribute(&attributes, "id"),
                tool_name: attributes.get("name").map(Value::to_string),
                result: serde_json::Value::String(result),
            });
        }
        trace!(%role, contents = content.len(), "message closed");
        self.conversation.push(Message { role, content });
    }

    fn open_content(
        &mut self,
        kind: ContentKind,
        attributes: &[Attribute],
        children: &Nodes,
        span: &Range<usize>,
        scope: ScopeId,
        source: Option<Arc<str>>,
    ) -> Result<(), CompileError> {
        let path = source.as_deref();
        if self.content.is_some() {
            return Err(nesting_error(
                ErrorCode::ContentTagInsideContent,
                "content tags cannot be nested",
                span,
                path,
            ));
        }
        let attributes = eval_attributes(attributes, &self.scopes, scope)
            .map_err(|e| CompileError::runtime(e, span, path))?;

        self.buffer().flush_text();
        self.content = Some(OpenContent {
            kind,
            attributes,
            text: String::new(),
        });
        self.frames.push(Frame::CloseContent);
        self.frames.push(Frame::Nodes {
            nodes: children.clone(),
            cursor: 0,
            scope,
            owns_scope: false,
            source,
        });
        Ok(())
    }

    fn close_content(&mut self) {
        let Some(OpenContent {
            kind,
            attributes,
            text,
        }) = self.content.take()
        else {
            return;
        };
        let text = text.trim().to_string();
        let content = match kind {
            ContentKind::Text if text.is_empty() => return,
            ContentKind::Text => Content::Text { text },
            ContentKind::Image => Content::Image { image: text },
            ContentKind::File => Content::File {
                file: text,
                mime_type: string_attribute(&attributes, "mime"),
            },
            ContentKind::ToolCall => Content::ToolCall {
                id: string_attribute(&attributes, "id"),
                name: string_attribute(&attributes, "name"),
                arguments: attributes
                    .get("arguments")
                    .map(Value::to_json)
                    .unwrap_or_else(|| serde_json::json!({})),
            },
        };
        self.buffer().content.push(content);
    }

    /// Content buffer of the open message, or the loose buffer.
    fn buffer(&mut self) -> &mut ContentBuffer {
        match &mut self.message {
            Some(message) => &mut message.buffer,
            None => &mut self.loose,
        }
    }

    fn open_step(
        &mut self,
        attributes: &[Attribute],
        children: &Nodes,
        span: &Range<usize>,
        scope: ScopeId,
        source: Option<Arc<str>>,
    ) -> Result<(), CompileError> {
        let path = source.as_deref();
        if self.message.is_some() {
            return Err(nesting_error(
                ErrorCode::StepTagInsideMessage,
                "step tags cannot appear inside a message",
                span,
                path,
            ));
        }
        if self.in_step {
            return Err(nesting_error(
                ErrorCode::StepTagInsideStep,
                "step tags cannot be nested",
                span,
                path,
            ));
        }
        if self.content.is_some() {
            return Err(nesting_error(
                ErrorCode::InvalidTagNesting,
                "content tags may only contain text and expressions",
                span,
                path,
            ));
        }
        let attributes = eval_attributes(attributes, &self.scopes, scope)
            .map_err(|e| CompileError::runtime(e, span, path))?;

        self.flush_loose();
        self.in_step = true;
        self.frames.push(Frame::CloseStep {
            as_var: attributes.get("as").map(Value::to_string),
            raw_var: attributes.get("raw").map(Value::to_string),
            scope,
        });
        self.frames.push(Frame::Nodes {
            nodes: children.clone(),
            cursor: 0,
            scope,
            owns_scope: false,
            source,
        });
        Ok(())
    }

    async fn enter_reference(
        &mut self,
        reference: &str,
        attributes: &[Attribute],
        span: &Range<usize>,
        scope: ScopeId,
        source: Option<Arc<str>>,
    ) -> Result<(), CompileError> {
        let path = source.as_deref();
        // Attributes are evaluated on the including side of the boundary.
        let passed = eval_attributes(attributes, &self.scopes, scope)
            .map_err(|e| CompileError::runtime(e, span, path))?;
        let resolved = self.resolver.resolve(reference, path, span).await?;

        let target = &resolved.path;
        let circular = self.root_path.as_ref() == Some(target) || self.references.contains(target);
        if circular {
            return Err(CompileError::new(
                ErrorCode::CircularReference,
                format!("circular reference to '{}'", target),
            )
            .with_span(span.clone())
            .with_source_path(path));
        }

        debug!(path = %target, depth = self.references.len() + 1, "entering reference");
        let isolated = self.scopes.isolated(passed);
        self.references.push(target.clone());
        self.frames.push(Frame::CloseReference);
        self.frames.push(Frame::Nodes {
            nodes: resolved.template.nodes.clone(),
            cursor: 0,
            scope: isolated,
            owns_scope: true,
            source: Some(target.clone()),
        });
        Ok(())
    }
}

fn nesting_error(code: ErrorCode, message: &str, span: &Range<usize>, path: Option<&str>) -> CompileError {
    CompileError::new(code, message)
        .with_span(span.clone())
        .with_source_path(path)
}

fn string_attribute(attributes: &HashMap<String, Value>, name: &str) -> String {
    attributes.get(name).map(Value::to_string).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(source: &str, parameters: HashMap<String, Value>, pause_at_steps: bool) -> ChainState {
        let template = promptl::Parser::new(source, 0).parse().unwrap();
        ChainState::new(&template, parameters, None, None, pause_at_steps, AbortHandle::default())
    }

    fn numbers(n: i64) -> HashMap<String, Value> {
        let items = (0..n).map(Value::from).collect();
        HashMap::from([("xs".to_string(), Value::Array(items))])
    }

    #[tokio::test]
    async fn finished_blocks_release_their_scopes() {
        let mut state = state(
            "{{ total = 0 }}{{ for x in xs }}{{ if x % 2 == 0 }}{{ total += x }}{{ else }}{{ odd = x }}{{ endif }}{{ endfor }}{{ total }}",
            numbers(1000),
            false,
        );
        assert_eq!(state.run().await.unwrap(), Outcome::Completed);
        assert_eq!(state.scopes.live(), 1);
        assert_eq!(state.conversation()[0].text_content(), "249500");
    }

    #[tokio::test]
    async fn paused_steps_keep_their_iteration_scope() {
        let mut state = state(
            "{{ for x in xs }}<step as=\"reply\"><user>{{ x }}</user></step>{{ x }}:{{ reply }} {{ endfor }}",
            numbers(3),
            true,
        );
        for step_index in 0..3 {
            assert_eq!(state.run().await.unwrap(), Outcome::Paused { step_index });
            assert_eq!(state.scopes.live(), 2);
            state.resume(vec![Message::assistant(format!("r{}", step_index))]);
        }
        assert_eq!(state.run().await.unwrap(), Outcome::Completed);
        assert_eq!(state.scopes.live(), 1);
        let texts: Vec<_> = state.conversation().iter().map(Message::text_content).collect();
        assert_eq!(texts, ["0", "r0", "0:r0", "1", "r1", "1:r1", "2", "r2", "2:r2"]);
    }
}
