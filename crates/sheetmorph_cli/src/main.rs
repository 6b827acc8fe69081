use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use sheetmorph::{
    Document, EvalValue, ExpressionSource, Manifest, OutputConfig, RunOptions, load_document,
    run_conversion, transform,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sheetmorph")]
#[command(version, about = "Convert spreadsheet sheets to JSON with query expressions")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run expressions over the sheets and write one harmonization file each
    Convert(ConvertArgs),
    /// Evaluate one expression and print the result
    Eval(EvalArgs),
    /// Print the aggregated sheets document
    Sheets(SourceArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Workbook, CSV file, or directory of CSV sheets
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    #[arg(short = 's', long = "sheet", required = true, num_args = 1..)]
    sheets: Vec<String>,
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,
    #[arg(short = 's', long = "sheet", num_args = 1..)]
    sheets: Vec<String>,
    /// Expression files, run in the given order
    #[arg(
        short = 'e',
        long = "expression",
        num_args = 1..,
        conflicts_with = "manifest",
        required_unless_present = "manifest"
    )]
    expressions: Vec<PathBuf>,
    /// Mapping manifest (YAML or JSON)
    #[arg(short = 'm', long = "manifest")]
    manifest: Option<PathBuf>,
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,
    /// Record failing expressions and continue with the rest
    #[arg(long, action = ArgAction::SetTrue)]
    keep_going: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("query").required(true).args(["expression", "inline"])))]
struct EvalArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(short = 'e', long = "expression")]
    expression: Option<PathBuf>,
    #[arg(short = 'x', long = "inline")]
    inline: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Convert(args) => run_convert(args),
        Command::Eval(args) => run_eval(args),
        Command::Sheets(args) => run_sheets(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_document(file: &Path, sheets: &[String]) -> Result<Document> {
    load_document(file, sheets).with_context(|| format!("failed to read {}", file.display()))
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let manifest = args
        .manifest
        .as_deref()
        .map(Manifest::load)
        .transpose()
        .context("failed to load manifest")?;

    let source = match (args.file, manifest.as_ref().and_then(|m| m.source.clone())) {
        (Some(file), _) | (None, Some(file)) => file,
        (None, None) => bail!("no source given: pass -f or set `source` in the manifest"),
    };
    let sheets = if !args.sheets.is_empty() {
        args.sheets
    } else {
        manifest.as_ref().map(|m| m.sheets.clone()).unwrap_or_default()
    };
    if sheets.is_empty() {
        bail!("no sheets given: pass -s or set `sheets` in the manifest");
    }

    let output = match args
        .output_dir
        .or_else(|| manifest.as_ref().and_then(|m| m.output_dir.clone()))
    {
        Some(dir) => OutputConfig::new(dir),
        None => OutputConfig::default(),
    };

    let expressions = match &manifest {
        Some(manifest) => manifest
            .expression_sources()
            .context("failed to load manifest expressions")?,
        None => args
            .expressions
            .iter()
            .map(|path| ExpressionSource::from_file(path))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to load expression")?,
    };

    let document = read_document(&source, &sheets)?;
    let options = RunOptions {
        keep_going: args.keep_going,
        ..RunOptions::default()
    };
    let report = run_conversion(&document, &expressions, &output, &options)
        .context("conversion failed")?;

    if !report.is_success() {
        for failure in &report.failures {
            error!("{}", failure);
        }
        bail!(
            "{} of {} expressions failed",
            report.failures.len(),
            expressions.len()
        );
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    let text = match (args.expression, args.inline) {
        (Some(path), _) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read expression file: {}", path.display()))?,
        (None, Some(text)) => text,
        (None, None) => bail!("pass an expression file with -e or an inline expression with -x"),
    };
    let document = read_document(&args.source.file, &args.source.sheets)?;
    match transform(&document, &text).context("evaluation failed")? {
        EvalValue::Value(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        EvalValue::Missing => warn!("expression produced no result"),
    }
    Ok(())
}

fn run_sheets(args: SourceArgs) -> Result<()> {
    let document = read_document(&args.file, &args.sheets)?;
    println!("{}", serde_json::to_string_pretty(document.as_value())?);
    Ok(())
}
