use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ConvertError, ConvertErrorKind};
use crate::pipeline::ExpressionSource;

/// Mapping manifest: which expressions to run and where results go.
///
/// Accepted as YAML or JSON. Relative paths are resolved against the manifest's
/// own directory by [`Manifest::load`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub sheets: Vec<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub mappings: Vec<MappingEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingEntry {
    #[serde(default)]
    pub name: Option<String>,
    /// Path of an expression file.
    #[serde(default)]
    pub expression: Option<PathBuf>,
    /// Expression written inline.
    #[serde(default)]
    pub expression_text: Option<String>,
}

pub fn parse_manifest(text: &str) -> Result<Manifest, ConvertError> {
    let manifest: Manifest = serde_yaml::from_str(text)?;
    manifest.validate()?;
    Ok(manifest)
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ConvertError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ConvertError::new(
                ConvertErrorKind::InvalidManifest,
                format!("failed to read manifest: {}", err),
            )
            .with_origin(path.display().to_string())
        })?;
        let manifest =
            parse_manifest(&text).map_err(|err| err.or_origin(path.display().to_string()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(manifest.resolve_paths(base))
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.mappings.is_empty() {
            return Err(invalid("manifest has no mappings"));
        }
        for (index, mapping) in self.mappings.iter().enumerate() {
            match (&mapping.expression, &mapping.expression_text) {
                (Some(_), None) | (None, Some(_)) => {}
                (Some(_), Some(_)) => {
                    return Err(invalid(format!(
                        "mappings[{}]: expression and expression_text are mutually exclusive",
                        index
                    )));
                }
                (None, None) => {
                    return Err(invalid(format!(
                        "mappings[{}]: one of expression or expression_text is required",
                        index
                    )));
                }
            }
            if mapping.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
                return Err(invalid(format!("mappings[{}]: name must not be empty", index)));
            }
        }
        Ok(())
    }

    /// Rebase relative paths onto `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let rebase = |path: PathBuf| {
            if path.is_relative() {
                base.join(path)
            } else {
                path
            }
        };
        self.source = self.source.map(rebase);
        self.output_dir = self.output_dir.map(rebase);
        for mapping in &mut self.mappings {
            mapping.expression = mapping.expression.take().map(rebase);
        }
        self
    }

    /// Load every mapping's expression, in manifest order.
    pub fn expression_sources(&self) -> Result<Vec<ExpressionSource>, ConvertError> {
        let mut sources = Vec::with_capacity(self.mappings.len());
        for (index, mapping) in self.mappings.iter().enumerate() {
            let source = match (&mapping.expression, &mapping.expression_text) {
                (Some(path), _) => ExpressionSource::from_file(path)?,
                (None, Some(text)) => ExpressionSource::literal(index + 1, text.clone()),
                (None, None) => {
                    return Err(invalid(format!(
                        "mappings[{}]: one of expression or expression_text is required",
                        index
                    )));
                }
            };
            sources.push(match &mapping.name {
                Some(name) => source.with_name(name.clone()),
                None => source,
            });
        }
        Ok(sources)
    }
}

fn invalid(message: impl Into<String>) -> ConvertError {
    ConvertError::new(ConvertErrorKind::InvalidManifest, message)
}
