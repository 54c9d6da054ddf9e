//! Artifact packaging
//!
//! Result files are zipped and attached to the job as named, typed
//! outputs. Packaging never fails a job: problems are written to the job
//! log and the upload is skipped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::context::JobContext;

/// Codec used for archive entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Stored,
    #[default]
    Deflated,
}

impl Compression {
    fn method(self) -> zip::CompressionMethod {
        match self {
            Compression::Stored => zip::CompressionMethod::Stored,
            Compression::Deflated => zip::CompressionMethod::Deflated,
        }
    }
}

/// How file paths are turned into archive entry names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripPath {
    /// Keep the full path, minus the root
    None,
    /// Keep only the file name
    Basename,
    /// Remove a leading directory
    Prefix(PathBuf),
}

impl StripPath {
    pub fn entry_name(&self, file: &Path) -> String {
        let relative = match self {
            StripPath::None => file,
            StripPath::Basename => file.file_name().map(Path::new).unwrap_or(file),
            StripPath::Prefix(prefix) => file.strip_prefix(prefix).unwrap_or(file),
        };

        relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactPackager {
    compression: Compression,
}

impl ArtifactPackager {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Writes the files into a zip archive
    ///
    /// # Arguments
    /// * `files` - Files to add, in order
    /// * `archive` - Path of the zip file to create
    /// * `strip` - Entry naming rule
    ///
    /// # Returns
    /// The number of entries written
    pub fn compress(&self, files: &[PathBuf], archive: &Path, strip: &StripPath) -> Result<usize> {
        let out = File::create(archive)
            .with_context(|| format!("Failed to create archive {}", archive.display()))?;
        let mut zip = ZipWriter::new(BufWriter::new(out));
        let options = SimpleFileOptions::default()
            .compression_method(self.compression.method())
            .large_file(true);

        for file in files {
            let name = strip.entry_name(file);
            debug!("Adding {} as {}", file.display(), name);
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to add entry {}", name))?;
            let mut input = File::open(file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            std::io::copy(&mut input, &mut zip)
                .with_context(|| format!("Failed to compress {}", file.display()))?;
        }

        zip.finish()
            .context("Failed to finish archive")?
            .flush()
            .context("Failed to flush archive")?;

        Ok(files.len())
    }

    /// Zips the files and uploads the archive as a job output
    ///
    /// Does nothing (apart from a log entry) when no file is given or none
    /// of them exist. Errors are logged, never returned.
    ///
    /// # Arguments
    /// * `ctx` - The job's context; receives the log entries
    /// * `output_name` - Name of the output on the job
    /// * `output_type` - Type name of the output
    /// * `files` - Candidate files; missing ones are skipped
    /// * `archive` - Where to write the zip file
    /// * `strip` - Entry naming rule
    ///
    /// # Returns
    /// Whether an output was uploaded
    pub async fn compress_and_upload(
        &self,
        ctx: &mut JobContext,
        output_name: &str,
        output_type: &str,
        files: &[PathBuf],
        archive: &Path,
        strip: StripPath,
    ) -> bool {
        if files.is_empty() {
            ctx.log_info(format!("No files to upload for output '{}'", output_name));
            return false;
        }

        let (present, missing): (Vec<PathBuf>, Vec<PathBuf>) =
            files.iter().cloned().partition(|file| file.is_file());
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|f| f.display().to_string()).collect();
            ctx.log_warning(format!(
                "Skipping missing files for output '{}': {}",
                output_name,
                names.join(", ")
            ));
        }
        if present.is_empty() {
            ctx.log_info(format!("None of the files for output '{}' exist", output_name));
            return false;
        }

        let packager = *self;
        let target = archive.to_path_buf();
        let compressed =
            tokio::task::spawn_blocking(move || packager.compress(&present, &target, &strip)).await;
        let count = match compressed {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                ctx.log_error(format!("Failed to compress output '{}': {:#}", output_name, e));
                return false;
            }
            Err(e) => {
                ctx.log_error(format!("Compression of output '{}' aborted: {}", output_name, e));
                return false;
            }
        };

        let data = match tokio::fs::read(archive).await {
            Ok(data) => data,
            Err(e) => {
                ctx.log_error(format!("Failed to read archive {}: {}", archive.display(), e));
                return false;
            }
        };

        let size = data.len();
        let pk = ctx.job_pk();
        let backend = Arc::clone(ctx.backend());
        let uploaded = backend.add_output(pk, output_name, output_type, data).await;
        match uploaded {
            Ok(()) => {
                ctx.log_info(format!(
                    "Uploaded output '{}' ({} file(s), {} bytes)",
                    output_name, count, size
                ));
                ctx.record_output(output_name);
                true
            }
            Err(e) => {
                ctx.log_error(format!("Failed to upload output '{}': {:#}", output_name, e));
                false
            }
        }
    }
}
