mod fs_references;
mod test_runner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};

use compiler::{Chain, CompileError, CompileOptions, Message, Value};
use fs_references::FsReferences;

#[derive(Parser)]
#[command(name = "promptl", version, about = "PromptL template compiler")]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a template into its full conversation (steps are transparent)
    Render(CompileArgs),

    /// Run a template step by step, answering each step with a canned response
    Chain(ChainArgs),

    /// Parse only; exit 0 if the template is valid
    Check { file: PathBuf },

    /// Dump the parsed node tree
    Ast { file: PathBuf },

    /// Run .test.promptl files
    Test(TestArgs),
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Template file; references resolve relative to its directory
    file: PathBuf,

    /// Parameter as key=value; the value is read as JSON when it parses, else as a string
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// JSON object file with parameters
    #[arg(long = "params", value_name = "FILE")]
    params_file: Option<PathBuf>,

    /// Print messages as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args)]
struct ChainArgs {
    #[command(flatten)]
    compile: CompileArgs,

    /// Assistant reply for each step, in order
    #[arg(short, long = "response")]
    responses: Vec<String>,
}

#[derive(clap::Args)]
struct TestArgs {
    /// A .test.promptl file or a directory containing them
    path: PathBuf,

    /// Run only tests in these categories (subfolder names). Repeatable.
    #[arg(short, long)]
    category: Vec<String>,

    /// List available categories and exit
    #[arg(long)]
    list_categories: bool,
}

/// Source files shown in diagnostics, keyed by the path the compiler reports.
struct Sources {
    files: SimpleFiles<String, String>,
    ids: HashMap<String, usize>,
    root_dir: PathBuf,
    color: ColorChoice,
}

impl Sources {
    fn new(root_dir: PathBuf, no_color: bool) -> Self {
        Sources {
            files: SimpleFiles::new(),
            ids: HashMap::new(),
            root_dir,
            color: if no_color { ColorChoice::Never } else { ColorChoice::Auto },
        }
    }

    fn add(&mut self, name: &str, source: String) -> usize {
        let id = self.files.add(name.to_string(), source);
        self.ids.insert(name.to_string(), id);
        id
    }

    /// File id for an error's source path, loading referenced files on demand.
    fn file_for(&mut self, path: &str) -> Option<usize> {
        if let Some(id) = self.ids.get(path) {
            return Some(*id);
        }
        let source = std::fs::read_to_string(self.root_dir.join(path.trim_start_matches('/'))).ok()?;
        Some(self.add(path, source))
    }

    fn report(&mut self, root_name: &str, error: &CompileError) {
        let path = error.source_path.as_deref().unwrap_or(root_name);
        let file_id = match error.span {
            Some(_) => self.file_for(path),
            None => None,
        };
        match file_id {
            Some(id) => {
                let writer = StandardStream::stderr(self.color);
                let config = term::Config::default();
                let diagnostic = error.to_diagnostic(id);
                let _ = term::emit_to_write_style(&mut writer.lock(), &config, &self.files, &diagnostic);
            }
            None => eprintln!("error[{}]: {} ({})", error.code, error.message, path),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Render(args) => do_render(args, cli.no_color).await,
        Command::Chain(args) => do_chain(args, cli.no_color).await,
        Command::Check { file } => do_parse(&file, cli.no_color, false).await,
        Command::Ast { file } => do_parse(&file, cli.no_color, true).await,
        Command::Test(args) => {
            if args.list_categories {
                test_runner::list_categories(&args.path);
                0
            } else {
                test_runner::run_tests(&args.path, cli.no_color, &args.category).await
            }
        }
    };
    process::exit(code);
}

/// A template read from disk, with everything needed to compile and report on it.
struct Loaded {
    name: String,
    source: String,
    sources: Sources,
}

async fn load(file: &Path, no_color: bool) -> Result<Loaded, String> {
    let source = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("cannot read '{}': {}", file.display(), e))?;
    let root_dir = file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    let mut sources = Sources::new(root_dir, no_color);
    sources.add(&name, source.clone());
    Ok(Loaded { name, source, sources })
}

async fn options(args: &CompileArgs, loaded: &Loaded) -> Result<CompileOptions, String> {
    let mut parameters = HashMap::new();
    if let Some(path) = &args.params_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| format!("'{}' is not a JSON object: {}", path.display(), e))?;
        parameters.extend(object.into_iter().map(|(k, v)| (k, Value::from(v))));
    }
    for raw in &args.params {
        let (key, value) = parse_param(raw)?;
        parameters.insert(key, value);
    }
    Ok(CompileOptions::new()
        .parameters(parameters)
        .reference_fn(Arc::new(FsReferences::new(loaded.sources.root_dir.clone())))
        .full_path(loaded.name.clone()))
}

/// `key=value`; the value is parsed as JSON and falls back to a plain string.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{}': expected KEY=VALUE", raw))?;
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_messages(messages: &[Message], json: bool) {
    if json {
        match serde_json::to_string_pretty(messages) {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("error: cannot serialize messages: {}", e),
        }
        return;
    }
    for message in messages {
        println!("[{}]", message.role);
        println!("{}", message.text_content());
        println!();
    }
}

async fn do_parse(file: &Path, no_color: bool, ast: bool) -> i32 {
    let mut loaded = match load(file, no_color).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    match promptl::Parser::new(loaded.source.clone(), 0).parse() {
        Ok(template) if ast => {
            println!("{:#?}", template);
            0
        }
        Ok(template) => {
            let refs = template.reference_paths();
            eprintln!("ok: {} parsed successfully", file.display());
            if template.has_steps() {
                eprintln!("steps: runs as a multi-step chain");
            }
            if !refs.is_empty() {
                eprintln!("references: {}", refs.join(", "));
            }
            0
        }
        Err(e) => {
            let name = loaded.name.clone();
            loaded.sources.report(&name, &CompileError::from(e));
            1
        }
    }
}

async fn do_render(args: CompileArgs, no_color: bool) -> i32 {
    let mut loaded = match load(&args.file, no_color).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let options = match options(&args, &loaded).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    match compiler::render(&loaded.source, options).await {
        Ok(output) => {
            if let Some(config) = &output.config {
                eprintln!("config: {}", config);
            }
            print_messages(&output.messages, args.json);
            0
        }
        Err(err) => {
            let name = loaded.name.clone();
            loaded.sources.report(&name, &err);
            1
        }
    }
}

async fn do_chain(args: ChainArgs, no_color: bool) -> i32 {
    let mut loaded = match load(&args.compile.file, no_color).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let options = match options(&args.compile, &loaded).await {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let name = loaded.name.clone();
    let mut chain = match Chain::new(&loaded.source, options) {
        Ok(c) => c,
        Err(err) => {
            loaded.sources.report(&name, &err);
            return 1;
        }
    };

    let mut responses = args.responses.into_iter();
    let mut input = None;
    let mut shown = 0;
    loop {
        let output = match chain.advance(input.take()).await {
            Ok(o) => o,
            Err(err) => {
                loaded.sources.report(&name, &err);
                return 1;
            }
        };
        print_messages(&output.conversation[shown..], args.compile.json);
        shown = output.conversation.len();

        let Some(step) = output.pending_step_index else {
            eprintln!("chain completed after {} step(s)", chain.step_count());
            return 0;
        };
        match responses.next() {
            Some(reply) => {
                eprintln!("-- step {} answered", step);
                input = Some(vec![Message::assistant(reply)]);
            }
            None => {
                eprintln!("-- paused at step {}: no response left", step);
                return 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_json_or_fall_back_to_strings() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), Value::Number(3.0)));
        assert_eq!(
            parse_param("who=world").unwrap(),
            ("who".to_string(), Value::String("world".into()))
        );
        assert_eq!(
            parse_param("xs=[1,true]").unwrap(),
            (
                "xs".to_string(),
                Value::Array(vec![Value::Number(1.0), Value::Bool(true)])
            )
        );
        assert_eq!(
            parse_param("eq=a=b").unwrap(),
            ("eq".to_string(), Value::String("a=b".into()))
        );
        assert!(parse_param("novalue").is_err());
    }
}
