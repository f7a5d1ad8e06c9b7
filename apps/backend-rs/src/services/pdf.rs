use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::AppError;

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> Result<Vec<u8>, AppError>;
}

/// Pipes HTML through a wkhtmltopdf-compatible binary (`<bin> -q - -`).
pub struct CommandPdfRenderer {
    binary: String,
    timeout: Duration,
}

impl CommandPdfRenderer {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PdfRenderer for CommandPdfRenderer {
    async fn render(&self, html: &str) -> Result<Vec<u8>, AppError> {
        let mut child = Command::new(&self.binary)
            .args(["--quiet", "--encoding", "utf-8", "--page-size", "A4", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                tracing::error!(binary = %self.binary, error = %error, "Failed to start PDF renderer");
                AppError::Dependency("PDF renderer is not available.".to_string())
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(html.as_bytes()).await.map_err(|error| {
                tracing::error!(error = %error, "Failed to stream HTML to PDF renderer");
                AppError::Dependency("PDF generation failed.".to_string())
            })?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::error!(timeout_s = self.timeout.as_secs(), "PDF renderer timed out");
                AppError::Dependency("PDF generation timed out.".to_string())
            })?
            .map_err(|error| {
                tracing::error!(error = %error, "PDF renderer crashed");
                AppError::Dependency("PDF generation failed.".to_string())
            })?;

        if !output.status.success() || !output.stdout.starts_with(b"%PDF") {
            tracing::error!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "PDF renderer returned an error"
            );
            return Err(AppError::Dependency("PDF generation failed.".to_string()));
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::PdfRenderer;
    use crate::error::AppError;

    /// Returns a fixed PDF header; fails for HTML containing `fail_marker`.
    #[derive(Default)]
    pub struct FakePdfRenderer {
        pub fail_marker: Option<String>,
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl PdfRenderer for FakePdfRenderer {
        async fn render(&self, html: &str) -> Result<Vec<u8>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(marker) = &self.fail_marker {
                if html.contains(marker.as_str()) {
                    return Err(AppError::Dependency("PDF generation failed.".to_string()));
                }
            }
            let mut bytes = b"%PDF-1.4\n".to_vec();
            bytes.extend_from_slice(html.as_bytes());
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CommandPdfRenderer, PdfRenderer};

    #[tokio::test]
    async fn missing_binary_is_a_dependency_error() {
        let renderer = CommandPdfRenderer::new(
            "definitely-not-a-real-pdf-binary",
            Duration::from_secs(1),
        );
        let error = renderer.render("<p>x</p>").await.expect_err("should fail");
        assert_eq!(error.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
