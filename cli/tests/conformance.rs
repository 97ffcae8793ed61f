use std::path::Path;
use std::process::Command;

fn promptl() -> Command {
    Command::new(env!("CARGO_BIN_EXE_promptl"))
}

#[test]
fn conformance_suite_passes() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/conformance");
    let output = promptl()
        .args(["--no-color", "test"])
        .arg(&dir)
        .output()
        .expect("failed to run promptl");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "conformance failures:\n{}", stderr);
    assert!(stderr.contains("test result: ok"));
}

#[test]
fn render_resolves_references_from_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("persona.promptl"), "<system>You are {{ name }}.</system>").unwrap();
    std::fs::write(
        dir.path().join("main.promptl"),
        "<prompt path=\"persona\" name={{ who }} />\n<user>Hi</user>",
    )
    .unwrap();

    let output = promptl()
        .args(["--no-color", "render", "--json", "-p", "who=\"a pirate\""])
        .arg(dir.path().join("main.promptl"))
        .output()
        .expect("failed to run promptl");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let messages: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        messages,
        serde_json::json!([
            { "role": "system", "content": [{ "type": "text", "text": "You are a pirate." }] },
            { "role": "user", "content": [{ "type": "text", "text": "Hi" }] },
        ])
    );
}

#[test]
fn check_reports_parse_errors() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("broken.promptl");
    std::fs::write(&file, "<user>never closed").unwrap();

    let output = promptl().args(["--no-color", "check"]).arg(&file).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unclosed-tag"));
}

#[test]
fn check_lists_steps_and_references() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("plan.promptl");
    std::fs::write(&file, "<step><prompt path=\"persona\" /><user>go</user></step>").unwrap();

    let output = promptl().args(["--no-color", "check"]).arg(&file).output().unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("steps: runs as a multi-step chain"));
    assert!(stderr.contains("references: persona"));

    std::fs::write(&file, "<user>go</user>").unwrap();
    let output = promptl().args(["--no-color", "check"]).arg(&file).output().unwrap();
    assert!(!String::from_utf8_lossy(&output.stderr).contains("steps:"));
}

#[test]
fn chain_stops_when_responses_run_out() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("steps.promptl");
    std::fs::write(&file, "<step><user>one</user></step><step><user>two</user></step>").unwrap();

    let output = promptl()
        .args(["--no-color", "chain", "-r", "first"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("one"));
    assert!(stdout.contains("first"));
    assert!(stdout.contains("two"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("paused at step 1"));
}
