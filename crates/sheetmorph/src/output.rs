use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::error::{ConvertError, ConvertErrorKind};
use crate::query_eval::EvalValue;

/// Suffix appended to every output file name.
pub const OUTPUT_SUFFIX: &str = ".harmonization.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

impl OutputConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, OUTPUT_SUFFIX))
    }

    /// Create the output directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<(), ConvertError> {
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            ConvertError::new(
                ConvertErrorKind::Output,
                format!("failed to create output directory: {}", err),
            )
            .with_origin(self.dir.display().to_string())
        })
    }
}

fn id_pattern() -> &'static Regex {
    static ID_PATTERN: OnceLock<Regex> = OnceLock::new();
    ID_PATTERN.get_or_init(|| Regex::new(r#""id"\s*:\s*"([^"]+)""#).expect("valid id pattern"))
}

/// Pick the output name for an expression.
///
/// Best-effort: the first `"id": "<value>"` literal in the expression text wins,
/// then the stem of the expression file, then `fallback`. The result is reduced
/// to characters that are safe in a file name.
pub fn derive_output_name(
    source_text: &str,
    source_path: Option<&Path>,
    fallback: &str,
) -> String {
    let from_id = id_pattern()
        .captures(source_text)
        .and_then(|caps| caps.get(1))
        .map(|m| sanitize_name(m.as_str()));
    if let Some(name) = from_id.filter(|name| !name.is_empty()) {
        return name;
    }

    let from_stem = source_path
        .and_then(|path| path.file_stem())
        .and_then(|stem| stem.to_str())
        .map(sanitize_name);
    if let Some(name) = from_stem.filter(|name| !name.is_empty()) {
        return name;
    }

    sanitize_name(fallback)
}

/// Keep `[A-Za-z0-9._-]` (and other alphanumerics), replace the rest with `_`,
/// and strip leading or trailing dots so the name cannot leave the output directory.
pub(crate) fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches('.').to_string()
}

/// Write one result as `<dir>/<name>.harmonization.json`.
pub fn write_result(
    config: &OutputConfig,
    name: &str,
    result: &EvalValue,
) -> Result<PathBuf, ConvertError> {
    config.ensure_dir()?;
    let path = config.path_for(name);
    let value = match result {
        EvalValue::Value(value) => value,
        EvalValue::Missing => {
            warn!(name, "expression produced no result, writing null");
            &JsonValue::Null
        }
    };
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(&path, text).map_err(|err| {
        ConvertError::new(
            ConvertErrorKind::Output,
            format!("failed to write output: {}", err),
        )
        .with_origin(path.display().to_string())
    })?;
    info!("Wrote {}{}", name, OUTPUT_SUFFIX);
    Ok(path)
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_name_from_embedded_id() {
        let text = r#"{ "resourceType": "ConceptMap", "id" : "observation-code", "group": [] }"#;
        assert_eq!(
            derive_output_name(text, Some(Path::new("jsonata/x.jsonata")), "mapping-1"),
            "observation-code"
        );
    }

    #[test]
    fn test_name_sanitized() {
        let text = r#"{"id": "unit map/v1"}"#;
        assert_eq!(derive_output_name(text, None, "fallback"), "unit_map_v1");
    }

    #[test]
    fn test_name_falls_back_to_stem_then_fallback() {
        assert_eq!(
            derive_output_name("unit.unit", Some(Path::new("dir/unit.jsonata")), "mapping-1"),
            "unit"
        );
        assert_eq!(derive_output_name("unit.unit", None, "mapping-1"), "mapping-1");
        assert_eq!(derive_output_name(r#"{"id": "..."}"#, None, "mapping-2"), "mapping-2");
    }

    #[test]
    fn test_sanitize_name_stays_in_directory() {
        assert_eq!(sanitize_name("../x"), "_x");
        assert_eq!(sanitize_name("a/../../b"), "a_.._.._b");
        assert_eq!(sanitize_name(".."), "");
        assert_eq!(sanitize_name(" Unit Map "), "Unit_Map");
    }

    #[test]
    fn test_write_result_pretty_json() {
        let temp = tempfile::tempdir().unwrap();
        let config = OutputConfig::new(temp.path().join("out"));
        let path = write_result(&config, "Unit", &EvalValue::Value(json!({"a": [1]}))).unwrap();
        assert_eq!(path, temp.path().join("out").join("Unit.harmonization.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n  \"a\": [\n    1\n  ]\n}\n");
    }

    #[test]
    fn test_write_missing_as_null() {
        let temp = tempfile::tempdir().unwrap();
        let config = OutputConfig::new(temp.path());
        let path = write_result(&config, "Empty", &EvalValue::Missing).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "null\n");
    }

    #[test]
    fn test_default_dir() {
        assert_eq!(OutputConfig::default().dir, PathBuf::from("output"));
    }
}
