use std::path::{Path, PathBuf};

use async_trait::async_trait;
use compiler::{ReferenceFn, ReferenceRecord};
use tracing::debug;

pub const EXTENSION: &str = "promptl";

/// Resolves `<prompt path="..">` references to files under a root directory.
///
/// Paths are relative to `root`; a leading `/` also means the root. A path
/// without an extension falls back to `<path>.promptl` when the bare name
/// does not exist.
#[derive(Debug, Clone)]
pub struct FsReferences {
    root: PathBuf,
}

impl FsReferences {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsReferences { root: root.into() }
    }

    fn candidates(&self, path: &str) -> Vec<(PathBuf, String)> {
        let relative = path.trim_start_matches('/');
        let mut out = vec![(self.root.join(relative), relative.to_string())];
        if Path::new(relative).extension().is_none() {
            let with_ext = format!("{}.{}", relative, EXTENSION);
            out.push((self.root.join(&with_ext), with_ext));
        }
        out
    }
}

#[async_trait]
impl ReferenceFn for FsReferences {
    async fn resolve(&self, path: &str, _source_path: Option<&str>) -> Option<ReferenceRecord> {
        for (file, canonical) in self.candidates(path) {
            match tokio::fs::read_to_string(&file).await {
                Ok(content) => {
                    debug!(file = %file.display(), "loaded reference");
                    return Some(ReferenceRecord {
                        content,
                        path: canonical,
                    });
                }
                Err(e) => debug!(file = %file.display(), error = %e, "reference candidate unreadable"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("shared")).unwrap();
        fs::write(dir.path().join("shared/intro.promptl"), "<system>intro</system>").unwrap();
        fs::write(dir.path().join("notes.txt"), "plain").unwrap();
        dir
    }

    #[tokio::test]
    async fn adds_the_default_extension() {
        let dir = project();
        let refs = FsReferences::new(dir.path());
        let record = refs.resolve("shared/intro", None).await.unwrap();
        assert_eq!(record.content, "<system>intro</system>");
        assert_eq!(record.path, "shared/intro.promptl");
    }

    #[tokio::test]
    async fn exact_names_win() {
        let dir = project();
        let refs = FsReferences::new(dir.path());
        let record = refs.resolve("/notes.txt", None).await.unwrap();
        assert_eq!(record.content, "plain");
        assert_eq!(record.path, "notes.txt");
    }

    #[tokio::test]
    async fn missing_files_resolve_to_none() {
        let dir = project();
        let refs = FsReferences::new(dir.path());
        assert!(refs.resolve("nope", None).await.is_none());
    }

    #[tokio::test]
    async fn renders_with_relative_references() {
        let dir = project();
        fs::write(
            dir.path().join("shared/outer.promptl"),
            "<prompt path=\"./intro\" /><user>hi</user>",
        )
        .unwrap();
        let options = compiler::CompileOptions::new()
            .reference_fn(std::sync::Arc::new(FsReferences::new(dir.path())))
            .full_path("main.promptl");
        let out = compiler::render("<prompt path=\"shared/outer\" />", options).await.unwrap();
        assert_eq!(
            out.messages,
            vec![compiler::Message::system("intro"), compiler::Message::user("hi")]
        );
    }
}
