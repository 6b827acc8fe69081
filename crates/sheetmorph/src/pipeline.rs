use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::error::{ConvertError, ConvertErrorKind};
use crate::model::Document;
use crate::output::{OutputConfig, derive_output_name, sanitize_name, write_result};
use crate::query_eval::{EvalOptions, EvalValue, evaluate_with_options};
use crate::reader::open_source;

/// One expression to run, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionSource {
    /// Explicit output name; derived from the text or path when absent.
    pub name: Option<String>,
    /// Shown in errors and logs: the file path or `<literal #n>`.
    pub label: String,
    pub text: String,
    pub path: Option<PathBuf>,
}

impl ExpressionSource {
    pub fn from_file(path: &Path) -> Result<Self, ConvertError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ConvertError::new(
                ConvertErrorKind::SourceUnreadable,
                format!("failed to read expression file: {}", err),
            )
            .with_origin(path.display().to_string())
        })?;
        Ok(Self {
            name: None,
            label: path.display().to_string(),
            text,
            path: Some(path.to_path_buf()),
        })
    }

    /// An inline expression; `number` is its 1-based position among literals.
    pub fn literal(number: usize, text: impl Into<String>) -> Self {
        Self {
            name: None,
            label: format!("<literal #{}>", number),
            text: text.into(),
            path: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Output name for the expression at `index` in a run. An explicit name is
    /// sanitized like a derived one; if nothing usable is left the name is derived.
    pub fn output_name(&self, index: usize) -> String {
        self.name
            .as_deref()
            .map(sanitize_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                derive_output_name(
                    &self.text,
                    self.path.as_deref(),
                    &format!("mapping-{}", index + 1),
                )
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Record a failing expression and continue with the next one.
    pub keep_going: bool,
    pub eval: EvalOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenOutput {
    pub name: String,
    pub path: PathBuf,
    /// The expression produced no result and `null` was written.
    pub missing: bool,
}

#[derive(Debug, Default)]
pub struct ConversionReport {
    pub written: Vec<WrittenOutput>,
    pub failures: Vec<ConvertError>,
}

impl ConversionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Open `source` and aggregate the requested sheets.
pub fn load_document<S: AsRef<str>>(source: &Path, sheets: &[S]) -> Result<Document, ConvertError> {
    let mut reader = open_source(source)?;
    aggregate(sheets, reader.as_mut())
}

/// Output names for a run, in input order. Two expressions that would write the
/// same file are an `Output` error, raised before anything is written.
pub fn output_names(expressions: &[ExpressionSource]) -> Result<Vec<String>, ConvertError> {
    let mut names: Vec<String> = Vec::with_capacity(expressions.len());
    for (index, source) in expressions.iter().enumerate() {
        let name = source.output_name(index);
        if let Some(first) = names.iter().position(|seen| *seen == name) {
            return Err(ConvertError::new(
                ConvertErrorKind::Output,
                format!(
                    "output name '{}' is used by both {} and {}",
                    name, expressions[first].label, source.label
                ),
            ));
        }
        names.push(name);
    }
    Ok(names)
}

/// Evaluate one expression against a document.
pub fn transform(document: &Document, expression: &str) -> Result<EvalValue, ConvertError> {
    evaluate_with_options(document.as_value(), expression, &EvalOptions::default())
}

/// Run every expression against `document`, writing one output file each.
///
/// Outputs are written in input order. Without `keep_going` the first failure is
/// returned and files written before it stay on disk. Duplicate output names fail
/// the run up front, even with `keep_going`.
pub fn run_conversion(
    document: &Document,
    expressions: &[ExpressionSource],
    output: &OutputConfig,
    options: &RunOptions,
) -> Result<ConversionReport, ConvertError> {
    let names = output_names(expressions)?;
    output.ensure_dir()?;
    info!("Set up output directory to '{}'", output.dir.display());

    let mut report = ConversionReport::default();
    for (source, name) in expressions.iter().zip(names) {
        match convert_one(document, source, name, output, options) {
            Ok(written) => report.written.push(written),
            Err(err) if options.keep_going => {
                warn!(expression = %source.label, error = %err, "expression failed, continuing");
                report.failures.push(err);
            }
            Err(err) => return Err(err),
        }
    }

    info!("Transformation done!");
    Ok(report)
}

fn convert_one(
    document: &Document,
    source: &ExpressionSource,
    name: String,
    output: &OutputConfig,
    options: &RunOptions,
) -> Result<WrittenOutput, ConvertError> {
    debug!(expression = %source.label, "evaluating expression");
    let result = evaluate_with_options(document.as_value(), &source.text, &options.eval)
        .map_err(|err| err.or_origin(source.label.clone()))?;
    let path = write_result(output, &name, &result)
        .map_err(|err| err.or_origin(source.label.clone()))?;
    Ok(WrittenOutput {
        name,
        path,
        missing: result.is_missing(),
    })
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::model::CellValue;
    use crate::reader::InMemoryWorkbook;

    fn document() -> Document {
        let cell = |s: &str| Some(CellValue::from(s));
        let mut workbook = InMemoryWorkbook::new().with_sheet(
            "unit",
            vec![
                vec![cell("unit"), cell("UCUM_code")],
                vec![cell("meters"), cell("m")],
                vec![cell("seconds"), cell("s")],
            ],
        );
        aggregate(&["unit"], &mut workbook).unwrap()
    }

    #[test]
    fn test_output_name_precedence() {
        let named = ExpressionSource::literal(1, r#"{"id": "from-id"}"#).with_name("Explicit");
        assert_eq!(named.output_name(0), "Explicit");
        let by_id = ExpressionSource::literal(1, r#"{"id": "from-id"}"#);
        assert_eq!(by_id.output_name(0), "from-id");
        let fallback = ExpressionSource::literal(2, "unit.unit");
        assert_eq!(fallback.output_name(1), "mapping-2");
    }

    #[test]
    fn test_explicit_name_is_sanitized() {
        let escaping = ExpressionSource::literal(1, "unit.unit").with_name("../x");
        assert_eq!(escaping.output_name(0), "_x");
        let dots = ExpressionSource::literal(1, r#"{"id": "from-id"}"#).with_name("..");
        assert_eq!(dots.output_name(0), "from-id");
    }

    #[test]
    fn test_escaping_name_writes_inside_output_dir() {
        let temp = tempfile::tempdir().unwrap();
        let output = OutputConfig::new(temp.path().join("out"));
        let expressions = vec![ExpressionSource::literal(1, "unit.unit").with_name("../x")];
        let report =
            run_conversion(&document(), &expressions, &output, &RunOptions::default()).unwrap();
        assert_eq!(report.written[0].path, temp.path().join("out").join("_x.harmonization.json"));
        assert!(!temp.path().join("x.harmonization.json").exists());
    }

    #[test]
    fn test_duplicate_output_names_fail_before_writing() {
        let temp = tempfile::tempdir().unwrap();
        let output = OutputConfig::new(temp.path().join("out"));
        let expressions = vec![
            ExpressionSource::literal(1, "unit.unit").with_name("Units"),
            ExpressionSource::literal(2, "unit.UCUM_code"),
            ExpressionSource::literal(3, r#"{"id": "Units", "v": unit.unit}"#),
        ];
        let options = RunOptions {
            keep_going: true,
            ..RunOptions::default()
        };
        let err = run_conversion(&document(), &expressions, &output, &options).unwrap_err();
        assert_eq!(err.kind, ConvertErrorKind::Output);
        assert!(err.message.contains("'Units'"));
        assert!(err.message.contains("<literal #1>"));
        assert!(err.message.contains("<literal #3>"));
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_run_writes_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let output = OutputConfig::new(temp.path());
        let expressions = vec![
            ExpressionSource::literal(1, "unit.unit").with_name("Units"),
            ExpressionSource::literal(2, "nothing.here").with_name("Empty"),
        ];
        let report =
            run_conversion(&document(), &expressions, &output, &RunOptions::default()).unwrap();
        assert!(report.is_success());
        let names: Vec<&str> = report.written.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["Units", "Empty"]);
        assert!(report.written[1].missing);
        let units = std::fs::read_to_string(temp.path().join("Units.harmonization.json")).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&units).unwrap(),
            serde_json::json!(["meters", "seconds"])
        );
    }

    #[test]
    fn test_first_failure_aborts() {
        let temp = tempfile::tempdir().unwrap();
        let output = OutputConfig::new(temp.path());
        let expressions = vec![
            ExpressionSource::literal(1, "unit.unit").with_name("First"),
            ExpressionSource::literal(2, "unit.(").with_name("Broken"),
            ExpressionSource::literal(3, "unit.UCUM_code").with_name("Never"),
        ];
        let err =
            run_conversion(&document(), &expressions, &output, &RunOptions::default()).unwrap_err();
        assert!(err.is_syntax());
        assert_eq!(err.origin.as_deref(), Some("<literal #2>"));
        assert!(temp.path().join("First.harmonization.json").exists());
        assert!(!temp.path().join("Never.harmonization.json").exists());
    }

    #[test]
    fn test_keep_going_collects_failures() {
        let temp = tempfile::tempdir().unwrap();
        let output = OutputConfig::new(temp.path());
        let expressions = vec![
            ExpressionSource::literal(1, "$nosuch()").with_name("Broken"),
            ExpressionSource::literal(2, "unit.UCUM_code").with_name("Codes"),
        ];
        let options = RunOptions {
            keep_going: true,
            ..RunOptions::default()
        };
        let report = run_conversion(&document(), &expressions, &output, &options).unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ConvertErrorKind::Evaluation);
        assert_eq!(report.written.len(), 1);
        assert!(temp.path().join("Codes.harmonization.json").exists());
    }

    #[test]
    fn test_transform_matches_evaluate() {
        let doc = document();
        let result = transform(&doc, "unit[UCUM_code = 's'].unit").unwrap();
        assert_eq!(result, EvalValue::Value(serde_json::json!("seconds")));
    }
}
