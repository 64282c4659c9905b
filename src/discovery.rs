//! Finding input files and deciding where their outputs go.
//!
//! An input location is either a single file or a directory searched
//! recursively for files with the input extension. Each input becomes a
//! [`TestCase`] whose id is its path relative to the searched directory.
//!
//! ```text
//! run:   inputs/a/1.in ──► out/a/1.out         (Destination::Save)
//! test:  inputs/a/1.in ──► expected/a/1.out    (Destination::Compare, must exist)
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::pipeline::{Destination, TestCase};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Input path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("No input files with extension {extension} found in {}", .dir.display())]
    NoInputs { dir: PathBuf, extension: String },

    #[error("No input has a matching expected output")]
    NoMatches,

    #[error("Output path {} already exists and is not empty", .0.display())]
    OutputExists(PathBuf),

    #[error("Output is a directory, but input is a file: {}", .0.display())]
    OutputIsDirectory(PathBuf),

    #[error("Output is a file, but input is a directory: {}", .0.display())]
    OutputIsFile(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to do when the run output target already has content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingOutput {
    /// Refuse to run.
    #[default]
    Fail,
    /// Write over existing files, keep the rest.
    Overwrite,
    /// Delete the target first.
    Clear,
}

fn with_dot(extension: &str) -> String {
    if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    }
}

/// Replaces the last extension of `path`.
pub fn replace_extension(path: &Path, extension: &str) -> PathBuf {
    path.with_extension(extension.trim_start_matches('.'))
}

fn case_id(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lists input files under `dir` ending with `extension`, as paths relative
/// to `dir`, sorted.
pub fn find_inputs(dir: &Path, extension: &str) -> DiscoveryResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(DiscoveryError::NotFound(dir.to_path_buf()));
    }

    let suffix = with_dot(extension);
    let mut inputs = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(&suffix));
        if matches {
            if let Ok(relative) = entry.path().strip_prefix(dir) {
                inputs.push(relative.to_path_buf());
            }
        }
    }

    inputs.sort();
    debug!("Found {} inputs in {}", inputs.len(), dir.display());
    Ok(inputs)
}

/// Rejects an existing output whose kind differs from the input's.
fn check_kinds(input: &Path, output: &Path) -> DiscoveryResult<()> {
    if input.is_file() && output.is_dir() {
        return Err(DiscoveryError::OutputIsDirectory(output.to_path_buf()));
    }
    if input.is_dir() && output.is_file() {
        return Err(DiscoveryError::OutputIsFile(output.to_path_buf()));
    }
    Ok(())
}

/// Builds run-mode cases. A file input maps to the output file itself; a
/// directory input maps each file to `<output>/<relative path>.out`.
pub fn run_cases(
    input: &Path,
    output: &Path,
    input_extension: &str,
    existing: ExistingOutput,
) -> DiscoveryResult<Vec<TestCase>> {
    check_kinds(input, output)?;
    prepare_output(output, existing)?;

    if input.is_file() {
        let id = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![TestCase::new(
            id,
            input,
            Destination::Save(output.to_path_buf()),
        )]);
    }

    let inputs = find_inputs(input, input_extension)?;
    if inputs.is_empty() {
        return Err(DiscoveryError::NoInputs {
            dir: input.to_path_buf(),
            extension: with_dot(input_extension),
        });
    }

    Ok(inputs
        .into_iter()
        .map(|relative| {
            let destination = Destination::Save(output.join(replace_extension(&relative, "out")));
            TestCase::new(case_id(&relative), input.join(&relative), destination)
        })
        .collect())
}

fn prepare_output(output: &Path, existing: ExistingOutput) -> DiscoveryResult<()> {
    let occupied = if output.is_dir() {
        std::fs::read_dir(output)?.next().is_some()
    } else {
        output.exists()
    };
    if !occupied {
        return Ok(());
    }

    match existing {
        ExistingOutput::Fail => Err(DiscoveryError::OutputExists(output.to_path_buf())),
        ExistingOutput::Overwrite => Ok(()),
        ExistingOutput::Clear => {
            if output.is_dir() {
                std::fs::remove_dir_all(output)?;
            } else {
                std::fs::remove_file(output)?;
            }
            debug!("Cleared {}", output.display());
            Ok(())
        }
    }
}

/// Test-mode cases paired with expected outputs.
#[derive(Debug, Clone, Default)]
pub struct Pairing {
    pub cases: Vec<TestCase>,
    /// Inputs with no expected output, by id.
    pub unmatched: Vec<String>,
}

/// Builds test-mode cases. Inputs without an expected file are skipped with
/// a warning; finding no pair at all is an error.
pub fn test_cases(
    input: &Path,
    expected: &Path,
    input_extension: &str,
    output_extension: &str,
) -> DiscoveryResult<Pairing> {
    check_kinds(input, expected)?;
    if input.is_file() {
        if !expected.is_file() {
            return Err(DiscoveryError::NoMatches);
        }
        let id = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(Pairing {
            cases: vec![TestCase::new(
                id,
                input,
                Destination::Compare(expected.to_path_buf()),
            )],
            unmatched: Vec::new(),
        });
    }

    let mut pairing = Pairing::default();
    for relative in find_inputs(input, input_extension)? {
        let expected_path = expected.join(replace_extension(&relative, output_extension));
        let id = case_id(&relative);
        if expected_path.is_file() {
            pairing.cases.push(TestCase::new(
                id,
                input.join(&relative),
                Destination::Compare(expected_path),
            ));
        } else {
            warn!("No expected output for {}", id);
            pairing.unmatched.push(id);
        }
    }

    if pairing.cases.is_empty() {
        return Err(DiscoveryError::NoMatches);
    }
    Ok(pairing)
}
