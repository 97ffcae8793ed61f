pub mod chain;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod message;
pub mod resolver;
pub mod scope;
pub mod value;

pub use chain::{AdvanceOutput, Chain, ChainStatus, CompileOptions, RenderOutput, render};
pub use error::{CompileError, RuntimeError};
pub use executor::AbortHandle;
pub use message::{Content, Message};
pub use promptl::{ErrorCode, MessageRole};
pub use resolver::{InMemoryReferences, ReferenceFn, ReferenceRecord, resolve_path};
pub use value::Value;
