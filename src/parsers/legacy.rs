//! Legacy binary office formats (doc, xls, ppt, rtf)
//!
//! These are converted to their OOXML counterpart by a headless LibreOffice
//! and then read by the package walker in [`super::office`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{ParseError, ParseResult};
use super::office::convert_with_media;
use super::probe::find_executable;
use super::traits::{ParseContext, Parser};
use super::types::{doc_type_of, ParseInput, ParsedContent, ParserId};

pub struct LegacyOfficeParser {
    soffice: PathBuf,
    timeout: Duration,
    /// Parent of the per-conversion scratch directories
    scratch_root: PathBuf,
}

impl LegacyOfficeParser {
    /// Find LibreOffice on `PATH`
    pub fn locate(timeout: Duration) -> Result<Self, String> {
        let soffice = find_executable(&["soffice", "libreoffice"])
            .ok_or_else(|| "libreoffice not found on PATH".to_string())?;
        Ok(Self::with_binary(soffice, timeout))
    }

    pub fn with_binary(soffice: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            soffice: soffice.into(),
            timeout,
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = dir.into();
        self
    }
}

/// OOXML extension a legacy format converts to
fn target_extension(extension: &str) -> Option<&'static str> {
    match extension {
        ".doc" | ".rtf" => Some("docx"),
        ".xls" => Some("xlsx"),
        ".ppt" => Some("pptx"),
        _ => None,
    }
}

#[async_trait]
impl Parser for LegacyOfficeParser {
    fn id(&self) -> ParserId {
        ParserId::LEGACY_OFFICE
    }

    async fn parse(&self, input: ParseInput, ctx: ParseContext) -> ParseResult<ParsedContent> {
        let target = target_extension(&input.extension)
            .ok_or_else(|| ParseError::Unsupported(input.extension.clone()))?;

        // Removed on drop, so a cancelled parse leaves nothing behind
        let scratch = tempfile::Builder::new()
            .prefix("file-reader-")
            .tempdir_in(&self.scratch_root)?;

        let result = self.convert(scratch.path(), &input, target).await;

        let dir = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(dir = %dir.display(), error = %e, "Failed to remove conversion scratch dir");
        }

        let converted = result?;
        let target_ext = format!(".{target}");
        let mut parsed =
            convert_with_media(&ctx, &input.name, &target_ext, Arc::new(converted)).await?;
        parsed.doc_type = doc_type_of(&input.extension);
        Ok(parsed)
    }
}

impl LegacyOfficeParser {
    async fn convert(&self, scratch: &Path, input: &ParseInput, target: &str) -> ParseResult<Vec<u8>> {
        let source = scratch.join(format!("source{}", input.extension));
        tokio::fs::write(&source, input.bytes.as_slice()).await?;

        // A private profile lets conversions run side by side
        let profile = format!("-env:UserInstallation=file://{}", scratch.join("profile").display());

        let child = Command::new(&self.soffice)
            .arg(profile)
            .arg("--headless")
            .arg("--norestore")
            .arg("--convert-to")
            .arg(target)
            .arg("--outdir")
            .arg(scratch)
            .arg(&source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParseError::Conversion(format!("failed to start libreoffice: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ParseError::Conversion(format!(
                    "libreoffice did not finish within {:?}",
                    self.timeout
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ParseError::Conversion(format!(
                "libreoffice exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let converted = scratch.join(format!("source.{target}"));
        debug!(name = %input.name, target, "Converted legacy office file");
        match tokio::fs::read(&converted).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ParseError::Conversion(
                "libreoffice produced no output".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager, ProcessingOptions};
    use crate::parsers::{ParserLoader, ParserSettings};
    use tempfile::TempDir;

    fn input(ext: &str) -> ParseInput {
        ParseInput {
            name: format!("old{ext}"),
            extension: ext.to_string(),
            bytes: Arc::new(b"\xD0\xCF\x11\xE0".to_vec()),
            options: ProcessingOptions::default(),
        }
    }

    fn ctx() -> ParseContext {
        ParseContext::new(
            CacheManager::new(CacheConfig::default()),
            ParserLoader::builtin(ParserSettings::default()),
        )
    }

    #[test]
    fn test_target_extension() {
        assert_eq!(target_extension(".doc"), Some("docx"));
        assert_eq!(target_extension(".rtf"), Some("docx"));
        assert_eq!(target_extension(".xls"), Some("xlsx"));
        assert_eq!(target_extension(".ppt"), Some("pptx"));
        assert_eq!(target_extension(".docx"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_conversion_error() {
        let parser =
            LegacyOfficeParser::with_binary("/nonexistent/soffice-7f3a", Duration::from_secs(5));
        let err = parser.parse(input(".doc"), ctx()).await.unwrap_err();
        assert!(matches!(err, ParseError::Conversion(_)));
    }

    /// Stand-in converter that never finishes in time
    #[cfg(unix)]
    fn stalled_converter(dir: &TempDir) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("soffice");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 5\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn scratch_entries(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_conversion_removes_scratch_dir() {
        let bin = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let parser = LegacyOfficeParser::with_binary(stalled_converter(&bin), Duration::from_secs(30))
            .with_scratch_root(scratch.path());

        // Same as the reader's per-file timeout aborting the task
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), parser.parse(input(".doc"), ctx())).await;
        assert!(outcome.is_err());
        assert_eq!(scratch_entries(&scratch), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_conversion_timeout_removes_scratch_dir() {
        let bin = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let parser = LegacyOfficeParser::with_binary(stalled_converter(&bin), Duration::from_millis(200))
            .with_scratch_root(scratch.path());

        match parser.parse(input(".ppt"), ctx()).await {
            Err(ParseError::Conversion(message)) => assert!(message.contains("200ms"), "{message}"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(scratch_entries(&scratch), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_converter_reports_exit_status() {
        // `false` ignores its arguments and exits 1
        let Some(binary) = find_executable(&["false"]) else {
            return;
        };
        let parser = LegacyOfficeParser::with_binary(binary, Duration::from_secs(5));
        match parser.parse(input(".xls"), ctx()).await {
            Err(ParseError::Conversion(message)) => assert!(message.contains("exited")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
