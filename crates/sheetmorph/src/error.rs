#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertErrorKind {
    SheetNotFound,
    SourceUnreadable,
    ExpressionSyntax,
    Evaluation,
    InvalidManifest,
    Output,
}

impl ConvertErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvertErrorKind::SheetNotFound => "SheetNotFound",
            ConvertErrorKind::SourceUnreadable => "SourceUnreadable",
            ConvertErrorKind::ExpressionSyntax => "ExpressionSyntax",
            ConvertErrorKind::Evaluation => "Evaluation",
            ConvertErrorKind::InvalidManifest => "InvalidManifest",
            ConvertErrorKind::Output => "Output",
        }
    }
}

/// 1-based position inside expression source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprLocation {
    pub line: usize,
    pub column: usize,
}

impl ExprLocation {
    /// Translate a byte offset in `source` into a line/column pair.
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in source.char_indices() {
            if idx >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertError {
    pub kind: ConvertErrorKind,
    pub message: String,
    /// Sheet name, file path or expression label the failure belongs to.
    pub origin: Option<String>,
    pub location: Option<ExprLocation>,
}

impl ConvertError {
    pub fn new(kind: ConvertErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
            location: None,
        }
    }

    pub fn sheet_not_found(sheet: &str) -> Self {
        ConvertError::new(
            ConvertErrorKind::SheetNotFound,
            format!("Sheet {} not found", sheet),
        )
        .with_origin(sheet)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        ConvertError::new(ConvertErrorKind::ExpressionSyntax, message)
    }

    pub fn eval(message: impl Into<String>) -> Self {
        ConvertError::new(ConvertErrorKind::Evaluation, message)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Sets the origin unless a more specific one is already attached.
    pub fn or_origin(mut self, origin: impl Into<String>) -> Self {
        if self.origin.is_none() {
            self.origin = Some(origin.into());
        }
        self
    }

    pub fn with_location(mut self, location: ExprLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_syntax(&self) -> bool {
        self.kind == ConvertErrorKind::ExpressionSyntax
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at line {}, column {})", location.line, location.column)?;
        }
        if let Some(origin) = &self.origin {
            write!(f, " [{}]", origin)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConvertError {}

impl From<csv::Error> for ConvertError {
    fn from(err: csv::Error) -> Self {
        ConvertError::new(
            ConvertErrorKind::SourceUnreadable,
            format!("csv error: {}", err),
        )
    }
}

impl From<calamine::Error> for ConvertError {
    fn from(err: calamine::Error) -> Self {
        ConvertError::new(
            ConvertErrorKind::SourceUnreadable,
            format!("spreadsheet error: {}", err),
        )
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::new(ConvertErrorKind::Output, format!("json error: {}", err))
    }
}

impl From<serde_yaml::Error> for ConvertError {
    fn from(err: serde_yaml::Error) -> Self {
        let mut error = ConvertError::new(
            ConvertErrorKind::InvalidManifest,
            format!("manifest error: {}", err),
        );
        if let Some(location) = err.location() {
            error = error.with_location(ExprLocation {
                line: location.line(),
                column: location.column(),
            });
        }
        error
    }
}
