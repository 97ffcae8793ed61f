use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use promptl::{ErrorCode, Parser, Template};
use tracing::debug;

use crate::error::CompileError;

/// Content returned by a [`ReferenceFn`] for one referenced document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRecord {
    pub content: String,
    /// Canonical path of the document; relative references inside it resolve against this.
    pub path: String,
}

/// Caller-supplied lookup for `<prompt path="..">` references.
///
/// Must return the same record for the same `(path, source_path)` within one compile.
#[async_trait]
pub trait ReferenceFn: Send + Sync {
    /// `path` has already been resolved against `source_path`.
    async fn resolve(&self, path: &str, source_path: Option<&str>) -> Option<ReferenceRecord>;
}

/// Resolve `path` against the directory of `source_path`, normalising `.` and `..` segments.
pub fn resolve_path(path: &str, source_path: Option<&str>) -> String {
    let (absolute, base) = if path.starts_with('/') {
        (true, "")
    } else {
        match source_path {
            Some(source) => (
                source.starts_with('/'),
                source.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""),
            ),
            None => (false, ""),
        }
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let joined = segments.join("/");
    if absolute { format!("/{}", joined) } else { joined }
}

/// A fetched and parsed referenced document.
#[derive(Debug)]
pub(crate) struct ResolvedReference {
    pub path: Arc<str>,
    pub template: Template,
}

/// Fetches references through the injected [`ReferenceFn`], once per `(path, source_path)`.
pub(crate) struct ReferenceResolver {
    reference_fn: Option<Arc<dyn ReferenceFn>>,
    cache: HashMap<(String, Option<String>), Arc<ResolvedReference>>,
}

impl ReferenceResolver {
    pub fn new(reference_fn: Option<Arc<dyn ReferenceFn>>) -> Self {
        ReferenceResolver {
            reference_fn,
            cache: HashMap::new(),
        }
    }

    /// `span` and `source_path` locate the `<prompt>` tag, for errors.
    pub async fn resolve(
        &mut self,
        path: &str,
        source_path: Option<&str>,
        span: &Range<usize>,
    ) -> Result<Arc<ResolvedReference>, CompileError> {
        let key = (path.to_string(), source_path.map(str::to_string));
        if let Some(hit) = self.cache.get(&key) {
            debug!(path, ?source_path, "reference cache hit");
            return Ok(hit.clone());
        }

        let Some(reference_fn) = &self.reference_fn else {
            return Err(CompileError::new(
                ErrorCode::MissingReferenceFunction,
                format!("cannot resolve '{}': no reference function was provided", path),
            )
            .with_span(span.clone())
            .with_source_path(source_path));
        };

        let full_path = resolve_path(path, source_path);
        debug!(path = %full_path, ?source_path, "reference cache miss, resolving");
        let record = reference_fn
            .resolve(&full_path, source_path)
            .await
            .ok_or_else(|| {
                CompileError::new(
                    ErrorCode::ReferenceNotFound,
                    format!("reference '{}' not found", full_path),
                )
                .with_span(span.clone())
                .with_source_path(source_path)
            })?;

        let template = Parser::new(record.content, 0)
            .parse()
            .map_err(|e| CompileError::from(e).with_source_path(Some(&record.path)))?;
        let resolved = Arc::new(ResolvedReference {
            path: Arc::from(record.path),
            template,
        });
        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }
}

/// A [`ReferenceFn`] over an in-memory map of documents. Counts lookups per path.
#[derive(Debug, Default)]
pub struct InMemoryReferences {
    documents: HashMap<String, String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl InMemoryReferences {
    pub fn new() -> Self {
        InMemoryReferences::default()
    }

    pub fn with(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.documents.insert(path.into(), content.into());
    }

    /// Number of times `path` was requested.
    pub fn calls(&self, path: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.values().sum()
    }
}

#[async_trait]
impl ReferenceFn for InMemoryReferences {
    async fn resolve(&self, path: &str, _source_path: Option<&str>) -> Option<ReferenceRecord> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(path.to_string()).or_default() += 1;
        }
        let content = self
            .documents
            .get(path)
            .or_else(|| self.documents.get(path.trim_start_matches('/')))?;
        Some(ReferenceRecord {
            content: content.clone(),
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_the_source_directory() {
        assert_eq!(resolve_path("child", None), "child");
        assert_eq!(resolve_path("child", Some("folder/parent")), "folder/child");
        assert_eq!(resolve_path("./child", Some("parent")), "child");
        assert_eq!(resolve_path("../shared/x", Some("a/b/parent")), "a/shared/x");
        assert_eq!(resolve_path("./x", Some("/root/p")), "/root/x");
    }

    #[test]
    fn absolute_paths_ignore_the_source() {
        assert_eq!(resolve_path("/abs/y", Some("a/b")), "/abs/y");
        assert_eq!(resolve_path("/abs/./z/../y", None), "/abs/y");
    }

    #[test]
    fn parent_segments_stop_at_the_root() {
        assert_eq!(resolve_path("../../../x", Some("a/p")), "x");
    }

    #[tokio::test]
    async fn in_memory_references_count_calls() {
        let refs = InMemoryReferences::new().with("a", "hello");
        assert_eq!(
            refs.resolve("a", None).await,
            Some(ReferenceRecord {
                content: "hello".into(),
                path: "a".into()
            })
        );
        assert_eq!(refs.resolve("missing", None).await, None);
        assert_eq!(refs.calls("a"), 1);
        assert_eq!(refs.total_calls(), 2);
    }

    #[tokio::test]
    async fn resolver_caches_per_path_and_source() {
        let refs = Arc::new(InMemoryReferences::new().with("dir/child", "<user>hi</user>"));
        let mut resolver = ReferenceResolver::new(Some(refs.clone() as Arc<dyn ReferenceFn>));
        let first = resolver
            .resolve("child", Some("dir/root"), &(0..1))
            .await
            .expect("resolve");
        let second = resolver
            .resolve("child", Some("dir/root"), &(0..1))
            .await
            .expect("resolve");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*first.path, "dir/child");
        assert_eq!(refs.calls("dir/child"), 1);
    }

    #[tokio::test]
    async fn resolver_errors() {
        let mut resolver = ReferenceResolver::new(None);
        let err = resolver.resolve("x", None, &(3..7)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingReferenceFunction);
        assert_eq!(err.span, Some(3..7));

        let mut resolver = ReferenceResolver::new(Some(Arc::new(InMemoryReferences::new()) as Arc<dyn ReferenceFn>));
        let err = resolver.resolve("x", None, &(0..1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ReferenceNotFound);

        let refs = InMemoryReferences::new().with("bad", "<user>");
        let mut resolver = ReferenceResolver::new(Some(Arc::new(refs) as Arc<dyn ReferenceFn>));
        let err = resolver.resolve("bad", None, &(0..1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnclosedTag);
        assert_eq!(err.source_path.as_deref(), Some("bad"));
    }
}
