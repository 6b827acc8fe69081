mod aggregate;
mod error;
mod manifest;
mod model;
mod output;
mod pipeline;
mod query_functions;
mod reader;
pub mod query_eval;
pub mod query_lexer;
pub mod query_model;
pub mod query_parser;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use aggregate::aggregate;
pub use error::{ConvertError, ConvertErrorKind, ExprLocation};
pub use manifest::{Manifest, MappingEntry, parse_manifest};
pub use model::{CellValue, Document, Record, number_to_json, rows_to_records};
pub use output::{OUTPUT_SUFFIX, OutputConfig, derive_output_name, write_result};
pub use pipeline::{
    ConversionReport, ExpressionSource, RunOptions, WrittenOutput, load_document, output_names,
    run_conversion, transform,
};
pub use query_eval::{EvalOptions, EvalValue, Evaluator, evaluate, evaluate_with_options};
pub use query_parser::parse_expression;
pub use reader::{CsvReader, InMemoryWorkbook, TabularReader, WorkbookReader, open_source};
