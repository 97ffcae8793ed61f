use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use compiler::{Chain, CompileError, CompileOptions, InMemoryReferences, Message, Value};

pub const TEST_SUFFIX: &str = ".test.promptl";

#[derive(Debug, Deserialize)]
pub struct ExpectedMessage {
    pub role: String,
    /// Concatenated text content of the message.
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct TestConfig {
    /// Human-readable test description.
    #[serde(default)]
    pub description: Option<String>,

    /// Path the template is compiled as; relative references resolve against it.
    #[serde(default)]
    pub path: Option<String>,

    /// Assistant replies, one per step, in order.
    #[serde(default)]
    pub responses: Vec<String>,

    /// Expected error code (e.g. `variable-not-declared`).
    #[serde(default)]
    pub expect_error: Option<String>,

    /// Expected number of steps the chain pauses at.
    #[serde(default)]
    pub expect_steps: Option<usize>,

    #[serde(default)]
    pub parameters: toml::Table,

    /// Fake referenced documents by path.
    #[serde(default)]
    pub references: BTreeMap<String, String>,

    /// Expected final conversation. Unchecked when absent.
    #[serde(default)]
    pub expect: Option<Vec<ExpectedMessage>>,
}

/// Split a `.test.promptl` file into its TOML config and template source.
fn parse_test_file(content: &str) -> Result<(TestConfig, &str), String> {
    let content = content.trim_start_matches('\u{feff}');

    let after_open = content
        .strip_prefix("---")
        .ok_or("missing opening --- frontmatter delimiter")?;
    let after_open = after_open
        .strip_prefix('\n')
        .or_else(|| after_open.strip_prefix("\r\n"))
        .unwrap_or(after_open);

    let close_pos = after_open
        .find("\n---")
        .ok_or("missing closing --- frontmatter delimiter")?;

    let toml_str = after_open[..close_pos].trim_end_matches('\r');
    let rest = &after_open[close_pos + 4..];
    let source = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);

    let config: TestConfig = toml::from_str(toml_str).map_err(|e| format!("TOML parse error: {}", e))?;
    Ok((config, source))
}

fn parameters(table: &toml::Table) -> Result<HashMap<String, Value>, String> {
    table
        .iter()
        .map(|(name, value)| {
            let json = serde_json::to_value(value).map_err(|e| format!("parameter '{}': {}", name, e))?;
            Ok((name.clone(), Value::from(json)))
        })
        .collect()
}

pub enum TestOutcome {
    Pass,
    Fail(String),
}

pub struct TestResult {
    pub path: PathBuf,
    pub description: Option<String>,
    pub outcome: TestOutcome,
}

/// Drive a chain to completion, answering each step from `responses`.
async fn run_chain(source: &str, config: &TestConfig) -> Result<(Vec<Message>, usize), CompileError> {
    let mut references = InMemoryReferences::new();
    for (path, content) in &config.references {
        references.insert(path.clone(), content.clone());
    }
    let mut options = CompileOptions::new()
        .parameters(parameters(&config.parameters).map_err(|e| {
            CompileError::new(compiler::ErrorCode::InvalidConfig, e)
        })?)
        .reference_fn(Arc::new(references));
    if let Some(path) = &config.path {
        options = options.full_path(path.clone());
    }

    let mut chain = Chain::new(source, options)?;
    let mut responses = config.responses.iter();
    let mut output = chain.advance(None).await?;
    while !output.is_complete {
        // Running out of scripted replies is answered with an empty assistant message.
        let reply = responses.next().map(String::as_str).unwrap_or_default();
        output = chain.advance(Some(vec![Message::assistant(reply)])).await?;
    }
    Ok((output.conversation, chain.step_count()))
}

fn check_messages(actual: &[Message], expected: &[ExpectedMessage]) -> Option<String> {
    let render = |role: &str, text: &str| format!("  [{}] {}", role, text.replace('\n', "\\n"));
    let actual_lines: Vec<String> = actual
        .iter()
        .map(|m| render(&m.role.to_string(), &m.text_content()))
        .collect();
    let expected_lines: Vec<String> = expected.iter().map(|m| render(&m.role, &m.text)).collect();
    if actual_lines == expected_lines {
        return None;
    }
    Some(format!(
        "conversation mismatch\n expected:\n{}\n actual:\n{}",
        expected_lines.join("\n"),
        actual_lines.join("\n")
    ))
}

async fn run_single_test(path: &Path) -> TestResult {
    let fail = |description: Option<String>, reason: String| TestResult {
        path: path.to_path_buf(),
        description,
        outcome: TestOutcome::Fail(reason),
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => return fail(None, format!("cannot read file: {}", e)),
    };
    let (config, source) = match parse_test_file(&content) {
        Ok(pair) => pair,
        Err(e) => return fail(None, format!("frontmatter error: {}", e)),
    };
    let description = config.description.clone();

    let reason = match (run_chain(source, &config).await, &config.expect_error) {
        (Err(err), Some(expected)) if err.code.as_str() == expected.as_str() => None,
        (Err(err), Some(expected)) => Some(format!("expected error {}, got {}", expected, err)),
        (Err(err), None) => Some(format!("unexpected error: {}", err)),
        (Ok(_), Some(expected)) => Some(format!("expected error {}, but compiling succeeded", expected)),
        (Ok((conversation, steps)), None) => match config.expect_steps {
            Some(expected) if expected != steps => {
                Some(format!("expected {} step(s), chain paused at {}", expected, steps))
            }
            _ => config
                .expect
                .as_deref()
                .and_then(|expected| check_messages(&conversation, expected)),
        },
    };

    match reason {
        Some(reason) => fail(description, reason),
        None => TestResult {
            path: path.to_path_buf(),
            description,
            outcome: TestOutcome::Pass,
        },
    }
}

/// Discover test files grouped by category (subfolder relative to root).
/// Files directly in `root` get category "".
fn discover_categorized(root: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut categories: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    collect_tests(root, root, &mut categories);
    for files in categories.values_mut() {
        files.sort();
    }
    categories
}

fn collect_tests(dir: &Path, root: &Path, out: &mut BTreeMap<String, Vec<PathBuf>>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tests(&path, root, out);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.ends_with(TEST_SUFFIX))
        {
            let category = path
                .parent()
                .and_then(|p| p.strip_prefix(root).ok())
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            out.entry(category).or_default().push(path);
        }
    }
}

pub fn list_categories(path: &Path) {
    if path.is_file() {
        eprintln!("(single file, no categories)");
        return;
    }
    let categories = discover_categorized(path);
    if categories.is_empty() {
        eprintln!("no {} files found in {}", TEST_SUFFIX, path.display());
        return;
    }
    eprintln!("available categories:");
    for (cat, files) in &categories {
        let label = if cat.is_empty() { "(root)" } else { cat.as_str() };
        eprintln!("  {} ({} tests)", label, files.len());
    }
}

struct Style {
    color: bool,
}

impl Style {
    fn paint(&self, s: &str, code: &str) -> String {
        if self.color {
            format!("\x1b[{}m{}\x1b[0m", code, s)
        } else {
            s.to_string()
        }
    }

    fn pass(&self) -> String {
        self.paint("PASS", "32")
    }

    fn fail(&self) -> String {
        self.paint("FAIL", "31")
    }
}

fn label(result: &TestResult) -> &str {
    result
        .description
        .as_deref()
        .or_else(|| result.path.file_name().and_then(|s| s.to_str()))
        .unwrap_or("?")
}

/// Run every test file under `path` (or a single file), optionally restricted
/// to `categories`. Returns the process exit code.
pub async fn run_tests(path: &Path, no_color: bool, categories: &[String]) -> i32 {
    let style = Style { color: !no_color };

    let selected: BTreeMap<String, Vec<PathBuf>> = if path.is_file() {
        BTreeMap::from([(String::new(), vec![path.to_path_buf()])])
    } else {
        let all = discover_categorized(path);
        if all.is_empty() {
            eprintln!("no {} files found in {}", TEST_SUFFIX, path.display());
            return 1;
        }
        if categories.is_empty() {
            all
        } else {
            let mut filtered = BTreeMap::new();
            for requested in categories {
                let req = requested.trim_matches('/');
                let prefix = format!("{}/", req);
                let matching: Vec<_> = all
                    .iter()
                    .filter(|(cat, _)| cat.as_str() == req || cat.starts_with(&prefix))
                    .collect();
                if matching.is_empty() {
                    eprintln!("warning: category '{}' not found", req);
                }
                for (cat, files) in matching {
                    filtered.insert(cat.clone(), files.clone());
                }
            }
            filtered
        }
    };

    if selected.is_empty() {
        eprintln!("no matching categories found");
        return 1;
    }

    let mut passed = 0usize;
    let mut failures: Vec<TestResult> = Vec::new();

    for (cat, files) in &selected {
        if !cat.is_empty() {
            eprintln!();
            eprintln!("{}", style.paint(cat, "1"));
        }
        for file in files {
            let result = run_single_test(file).await;
            match &result.outcome {
                TestOutcome::Pass => {
                    passed += 1;
                    eprintln!("  {}  {}", style.pass(), label(&result));
                }
                TestOutcome::Fail(_) => {
                    eprintln!("  {}  {}", style.fail(), label(&result));
                    failures.push(result);
                }
            }
        }
    }

    if !failures.is_empty() {
        eprintln!();
        eprintln!("failures:");
        for f in &failures {
            eprintln!();
            eprintln!("  --- {} ---", f.path.display());
            if let TestOutcome::Fail(reason) = &f.outcome {
                for line in reason.lines() {
                    eprintln!("  {}", line);
                }
            }
        }
    }

    eprintln!();
    if failures.is_empty() {
        eprintln!("test result: {}. {} passed, 0 failed", style.paint("ok", "32"), passed);
        0
    } else {
        eprintln!(
            "test result: {}. {} passed, {} failed (of {})",
            style.paint("FAILED", "31"),
            passed,
            failures.len(),
            passed + failures.len()
        );
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const GREETING: &str = r#"---
description = "greets by name"
responses = ["fine"]
expect_steps = 1

[parameters]
name = "Ada"

[[expect]]
role = "user"
text = "Hi Ada"

[[expect]]
role = "assistant"
text = "fine"
---
<step><user>Hi {{ name }}</user></step>
"#;

    #[test]
    fn splits_frontmatter_from_source() {
        let (config, source) = parse_test_file(GREETING).unwrap();
        assert_eq!(config.description.as_deref(), Some("greets by name"));
        assert_eq!(config.responses, vec!["fine".to_string()]);
        assert_eq!(config.expect.as_ref().map(Vec::len), Some(2));
        assert_eq!(source, "<step><user>Hi {{ name }}</user></step>\n");
    }

    #[test]
    fn rejects_files_without_frontmatter() {
        assert!(parse_test_file("<user>hi</user>").is_err());
        assert!(parse_test_file("---\ndescription = \"x\"\n").is_err());
    }

    #[tokio::test]
    async fn passing_and_failing_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("steps")).unwrap();
        fs::write(dir.path().join("steps/greeting.test.promptl"), GREETING).unwrap();
        fs::write(
            dir.path().join("missing.test.promptl"),
            "---\nexpect_error = \"variable-not-declared\"\n---\n{{ nope }}",
        )
        .unwrap();

        let single = run_single_test(&dir.path().join("steps/greeting.test.promptl")).await;
        assert!(matches!(single.outcome, TestOutcome::Pass));
        assert_eq!(run_tests(dir.path(), true, &[]).await, 0);

        fs::write(
            dir.path().join("wrong.test.promptl"),
            "---\n[[expect]]\nrole = \"user\"\ntext = \"a\"\n---\n<user>b</user>",
        )
        .unwrap();
        let wrong = run_single_test(&dir.path().join("wrong.test.promptl")).await;
        assert!(matches!(wrong.outcome, TestOutcome::Fail(ref r) if r.contains("conversation mismatch")));
        assert_eq!(run_tests(dir.path(), true, &[]).await, 1);
        assert_eq!(run_tests(dir.path(), true, &["steps".to_string()]).await, 0);
    }

    #[test]
    fn categories_follow_folders() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.test.promptl"), GREETING).unwrap();
        fs::write(dir.path().join("a/b/x.test.promptl"), GREETING).unwrap();
        fs::write(dir.path().join("a/ignored.promptl"), "").unwrap();
        let found = discover_categorized(dir.path());
        assert_eq!(found.keys().cloned().collect::<Vec<_>>(), vec!["".to_string(), "a/b".to_string()]);
    }
}
