//! strata cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; strata ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a template file
    ///
    /// Writes to stdout unless --output is given
    Render(RenderCommand),

    /// Resolve variables and print them
    #[command(alias = "eval")]
    Vars(VarsCommand),

    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct RenderCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    /// Write the result to this file, parent directories are created
    #[clap(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Template file to render
    pub template: PathBuf,
}

#[derive(Parser, Debug)]
pub struct VarsCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Leave out variables given with --set
    #[clap(long = "exclude-initial")]
    pub exclude_initial: bool,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Load a vars file
    ///
    /// Can be specified multiple times. Every file is a new layer
    /// and can reference variables of the files before it.
    #[clap(short = 'f', long = "vars-file")]
    pub files: Vec<PathBuf>,

    /// Load every *.yml and *.yaml file in the given directory
    ///
    /// Files are loaded in sorted order, after --vars-file.
    #[clap(short = 'd', long = "vars-dir")]
    pub directories: Vec<PathBuf>,

    /// Set a protected variable, the value is parsed as YAML
    #[clap(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[command(subcommand)]
    pub command: DevSubCommand,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// Lexer output
    Tokens { template: PathBuf },
    /// Compiled statements
    Tree { template: PathBuf },
}
