//! Format-adaptive document parsing
//!
//! Every supported upload is normalised to markdown text before chunking.
//! Format dispatch is by filename extension; PDFs additionally go through a
//! complexity score that decides between the fast text extractor and the
//! layout-preserving path.

pub mod pdf;

use crate::error::{ParseError, Result};
use tracing::debug;

/// Supported input formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Office,
    Markdown,
    PlainText,
}

impl DocumentFormat {
    /// Detect the format from the filename extension, case-insensitive
    pub fn detect(filename: &str) -> Option<Self> {
        let ext = filename.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" | "pptx" | "xls" | "xlsx" => Some(Self::Office),
            "md" | "markdown" => Some(Self::Markdown),
            "txt" => Some(Self::PlainText),
            _ => None,
        }
    }
}

/// Office-to-markdown conversion is delegated to an external collaborator;
/// implementations wrap whatever converter the deployment ships with.
pub trait OfficeConverter: Send + Sync {
    fn convert(&self, filename: &str, bytes: &[u8]) -> Result<String>;
}

/// Default converter for deployments without an office toolchain
pub struct UnavailableOfficeConverter;

impl OfficeConverter for UnavailableOfficeConverter {
    fn convert(&self, filename: &str, _bytes: &[u8]) -> Result<String> {
        Err(ParseError::ParseFailure(format!(
            "no office converter configured for {}",
            filename
        ))
        .into())
    }
}

/// Parser front-end: detects the format and emits unified markdown
pub struct DocumentParser {
    office: Box<dyn OfficeConverter>,
}

impl DocumentParser {
    pub fn new() -> Self {
        Self {
            office: Box::new(UnavailableOfficeConverter),
        }
    }

    pub fn with_office_converter(converter: Box<dyn OfficeConverter>) -> Self {
        Self { office: converter }
    }

    /// Parse raw bytes into markdown text
    pub fn parse(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let format = DocumentFormat::detect(filename).ok_or_else(|| {
            ParseError::UnsupportedFormat(
                filename
                    .rsplit('.')
                    .next()
                    .unwrap_or(filename)
                    .to_string(),
            )
        })?;

        debug!(filename, ?format, "parsing document");

        match format {
            DocumentFormat::Pdf => pdf::parse_pdf(bytes),
            DocumentFormat::Office => self.office.convert(filename, bytes),
            DocumentFormat::Markdown | DocumentFormat::PlainText => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    ParseError::ParseFailure(format!("file is not valid UTF-8: {}", e))
                })?;
                Ok(text.to_string())
            }
        }
    }
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::new()
    }
}
