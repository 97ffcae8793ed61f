use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use promptl::{ErrorCode, Parser, Template};
use tracing::debug;

use crate::error::CompileError;
use crate::executor::{AbortHandle, ChainState, Outcome};
use crate::message::Message;
use crate::resolver::ReferenceFn;
use crate::value::Value;

/// Inputs of a compile besides the template text.
#[derive(Clone, Default)]
pub struct CompileOptions {
    pub parameters: HashMap<String, Value>,
    pub reference_fn: Option<Arc<dyn ReferenceFn>>,
    /// Path of the root document; relative references resolve against it.
    pub full_path: Option<String>,
}

impl CompileOptions {
    pub fn new() -> Self {
        CompileOptions::default()
    }

    pub fn parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn reference_fn(mut self, reference_fn: Arc<dyn ReferenceFn>) -> Self {
        self.reference_fn = Some(reference_fn);
        self
    }

    pub fn full_path(mut self, path: impl Into<String>) -> Self {
        self.full_path = Some(path.into());
        self
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("reference_fn", &self.reference_fn.is_some())
            .field("full_path", &self.full_path)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Idle,
    Running,
    Paused { step_index: usize },
    Completed,
    Failed(ErrorCode),
}

/// Result of one [`Chain::advance`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceOutput {
    /// Every message produced so far, including the caller's responses.
    pub conversation: Vec<Message>,
    pub is_complete: bool,
    /// Index of the step the chain is paused at; `None` once complete.
    pub pending_step_index: Option<usize>,
    /// Frontmatter config of the root document.
    pub config: Option<serde_json::Value>,
}

/// Resumable evaluation of a template across model round-trips.
///
/// Each `advance` runs until the end of the next `<step>` (pausing there so
/// the caller can query a model) or to the end of the document.
pub struct Chain {
    template: Template,
    state: Option<ChainState>,
    status: ChainStatus,
    step_count: usize,
    abort: AbortHandle,
    full_path: Option<String>,
}

impl Chain {
    /// Parse the template. Nothing is evaluated until the first `advance`.
    pub fn new(source: &str, options: CompileOptions) -> Result<Self, CompileError> {
        let template = Parser::new(source, 0)
            .parse()
            .map_err(|e| CompileError::from(e).with_source_path(options.full_path.as_deref()))?;
        let abort = AbortHandle::default();
        let state = ChainState::new(
            &template,
            options.parameters,
            options.reference_fn,
            options.full_path.as_deref(),
            true,
            abort.clone(),
        );
        Ok(Chain {
            template,
            state: Some(state),
            status: ChainStatus::Idle,
            step_count: 0,
            abort,
            full_path: options.full_path,
        })
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    /// Steps paused at so far.
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn config(&self) -> Option<&serde_json::Value> {
        self.template.config.as_ref()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run to the next step boundary or to completion.
    ///
    /// The first call takes no responses. Every call made while paused must
    /// supply the model's response messages, which are appended to the
    /// conversation before evaluation continues.
    #[tracing::instrument(skip(self, responses), fields(path = ?self.full_path, status = ?self.status))]
    pub async fn advance(&mut self, responses: Option<Vec<Message>>) -> Result<AdvanceOutput, CompileError> {
        match (self.status, &responses) {
            (ChainStatus::Completed, _) => {
                return Err(CompileError::new(ErrorCode::ChainCompleted, "chain has already completed"));
            }
            (ChainStatus::Failed(code), _) => {
                return Err(CompileError::new(
                    ErrorCode::ChainFailed,
                    format!("chain has failed with {}", code),
                ));
            }
            (ChainStatus::Idle, Some(_)) => {
                return Err(CompileError::new(
                    ErrorCode::InvalidStepResponse,
                    "responses given before the chain has started",
                ));
            }
            (ChainStatus::Paused { step_index }, None) => {
                return Err(CompileError::new(
                    ErrorCode::InvalidStepResponse,
                    format!("step {} is waiting for response messages", step_index),
                ));
            }
            (ChainStatus::Paused { step_index }, Some(r)) if r.is_empty() => {
                return Err(CompileError::new(
                    ErrorCode::InvalidStepResponse,
                    format!("step {} is waiting for response messages", step_index),
                ));
            }
            (ChainStatus::Running, _) => {
                // A previous advance was dropped mid-run; its state cannot be trusted.
                self.state = None;
                self.status = ChainStatus::Failed(ErrorCode::ChainFailed);
                return Err(CompileError::new(
                    ErrorCode::ChainFailed,
                    "a previous advance was interrupted",
                ));
            }
            _ => {}
        }

        let Some(state) = self.state.as_mut() else {
            return Err(CompileError::new(ErrorCode::ChainFailed, "chain state was discarded"));
        };
        if let Some(responses) = responses {
            debug!(count = responses.len(), "resuming with responses");
            state.resume(responses);
        }

        self.status = ChainStatus::Running;
        match state.run().await {
            Ok(Outcome::Paused { step_index }) => {
                self.status = ChainStatus::Paused { step_index };
                self.step_count = step_index + 1;
                Ok(AdvanceOutput {
                    conversation: state.conversation().to_vec(),
                    is_complete: false,
                    pending_step_index: Some(step_index),
                    config: self.template.config.clone(),
                })
            }
            Ok(Outcome::Completed) => {
                debug!("chain completed");
                self.status = ChainStatus::Completed;
                let conversation = self.state.take().map(ChainState::into_conversation).unwrap_or_default();
                Ok(AdvanceOutput {
                    conversation,
                    is_complete: true,
                    pending_step_index: None,
                    config: self.template.config.clone(),
                })
            }
            Err(err) => {
                debug!(code = %err.code, "chain failed");
                self.status = ChainStatus::Failed(err.code);
                self.state = None;
                Err(err)
            }
        }
    }
}

/// Output of a single-shot [`render`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    pub messages: Vec<Message>,
    pub config: Option<serde_json::Value>,
}

/// Compile the whole document at once. Step tags are transparent.
pub async fn render(source: &str, options: CompileOptions) -> Result<RenderOutput, CompileError> {
    let template = Parser::new(source, 0)
        .parse()
        .map_err(|e| CompileError::from(e).with_source_path(options.full_path.as_deref()))?;
    let mut state = ChainState::new(
        &template,
        options.parameters,
        options.reference_fn,
        options.full_path.as_deref(),
        false,
        AbortHandle::default(),
    );
    state.run().await?;
    Ok(RenderOutput {
        messages: state.into_conversation(),
        config: template.config,
    })
}
