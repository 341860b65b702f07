mod cli;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use strata::{Context, Template, Value};

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STRATA_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Render(render_cli) => render(render_cli),
        cli::Command::Vars(vars_cli) => vars(vars_cli),
        cli::Command::Dev(dev_cli) => dev(dev_cli),
    };

    if let Err(e) = command_result {
        match e.downcast_ref::<strata::Error>() {
            Some(error) => eprintln!("{}", error.report(std::io::stderr().is_terminal())),
            None => {
                for error in e.chain() {
                    eprintln!("{error}")
                }
            }
        }
        std::process::exit(1);
    }
}

pub fn render(cli: cli::RenderCommand) -> anyhow::Result<()> {
    let context = load(&cli.input)?;
    let template = Template::from_file(&cli.template)?;

    match &cli.output {
        Some(target) => template.render_to_file(target, &context)?,
        None => print!("{}", template.render_text(&context)?),
    }

    Ok(())
}

pub fn vars(cli: cli::VarsCommand) -> anyhow::Result<()> {
    let context = load(&cli.input)?;
    let vars = context.as_map(cli.exclude_initial)?;

    output(&cli.output, &Value::Object(vars))
}

/// Protected `--set` variables at the root, one layer per vars file on top
fn load(input: &cli::InputArgs) -> anyhow::Result<Context> {
    let root = Context::new();
    for (key, raw) in &input.set {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Invalid value for --set {key}: {e}"))?;
        root.insert(key.as_str(), Value::from(value));
    }

    let mut files = input.files.clone();
    for dir_path in &input.directories {
        files.extend(vars_files(dir_path)?);
    }

    let mut context = root.chain();
    for file_path in &files {
        context.load_file(file_path)?;
        context = context.chain();
    }

    tracing::debug!(files = files.len(), "loaded vars");
    Ok(context)
}

fn vars_files(dir_path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in std::fs::read_dir(dir_path)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }

    anyhow::ensure!(!files.is_empty(), "No vars files in {}", dir_path.display());
    files.sort();
    Ok(files)
}

fn output(output: &cli::OutputArgs, value: &Value) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), value)?,
    };

    Ok(())
}

/// (strata-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand::*;

    match cli.command {
        Tokens { template } => {
            let source = std::fs::read_to_string(&template)?;
            let tokens = strata::lexer::tokenize(&source)
                .map_err(|e| anyhow::anyhow!("{e} at byte {}", e.start))?;
            println!("{tokens:#?}");
        }
        Tree { template } => {
            let template = Template::from_file(&template)?;
            println!("{:#?}", template.program().body);
        }
    }

    Ok(())
}
