//! [`ImageComparator`] backed by an external inference script.
//!
//! The script is run as `<program> <script> <reference> <returned>` and must print
//! one JSON object on stdout (see [`parse_comparator_output`]). Any failure maps to
//! a [`ComparatorError`], which the dispatcher treats as "comparator unavailable".
//!
//! The adapter does not enforce a timeout itself. The child is spawned with
//! `kill_on_drop(true)`, so when the caller's timeout drops the future the
//! process is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use lendkiosk_ai::{ComparatorError, ComparisonResult, ImageComparator, parse_comparator_output};

/// Bytes of stderr kept in error messages.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparatorConfig {
    pub enabled: bool,
    /// Interpreter or executable that runs the script.
    pub program: String,
    pub script: PathBuf,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "python3".to_string(),
            script: PathBuf::from("scripts/compare_images.py"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessComparator {
    config: ComparatorConfig,
}

impl SubprocessComparator {
    pub fn new(config: ComparatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComparatorConfig {
        &self.config
    }
}

#[async_trait]
impl ImageComparator for SubprocessComparator {
    async fn compare(
        &self,
        reference: &Path,
        returned: &Path,
    ) -> Result<ComparisonResult, ComparatorError> {
        if !self.config.enabled {
            return Err(ComparatorError::Disabled);
        }

        for image in [reference, returned] {
            if !exists(image).await {
                return Err(ComparatorError::MissingImage(image.display().to_string()));
            }
        }
        if !exists(&self.config.script).await {
            return Err(ComparatorError::Io(format!(
                "comparator script not found: {}",
                self.config.script.display()
            )));
        }

        let start = Instant::now();
        let output = Command::new(&self.config.program)
            .arg(&self.config.script)
            .arg(reference)
            .arg(returned)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComparatorError::Io(e.to_string()))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            elapsed_ms,
            exit_code = output.status.code().unwrap_or(-1),
            "AI comparator finished"
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ComparatorError::Io(format!(
                "comparator exited with {}: {excerpt}",
                output.status
            )));
        }

        parse_comparator_output(&stdout)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
