use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::{
    context::Context,
    lexer,
    pipeline::ProcessError,
    printer::{self, Printer},
};

/// Width of the per-file formatting fan-out.
const CONCURRENCY: usize = 10;

fn describe(errors: &[(PathBuf, ProcessError)]) -> String {
    errors
        .iter()
        .map(|(path, e)| format!("{}: {}", path.display(), e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accumulated per-file formatting failures.
#[derive(Debug, Error)]
#[error("{}", describe(.errors))]
pub struct FormatError {
    pub errors: Vec<(PathBuf, ProcessError)>,
}

/// Formats all files in place, at most `CONCURRENCY` at a time. Failures
/// do not stop the other files; they are collected into one error.
pub async fn format_files(paths: Vec<PathBuf>) -> Result<(), FormatError> {
    let sema = Arc::new(Semaphore::new(CONCURRENCY));
    let mut handles = Vec::new();
    for path in paths {
        let sema = sema.clone();
        let task_path = path.clone();
        handles.push((
            path,
            tokio::task::spawn(async move {
                let _permit = sema.acquire_owned().await.expect("semaphore closed");
                tokio::task::spawn_blocking(move || format_file(&task_path))
                    .await
                    .expect("formatting task panicked")
            }),
        ));
    }
    let mut errors = Vec::new();
    for (path, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push((path, e)),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FormatError { errors })
    }
}

/// Canonicalises one file: text between directives is copied verbatim,
/// each directive's span is replaced by its canonical rendering, and the
/// output always ends with a newline. The replacement is atomic: a
/// temporary file in the same directory is renamed over the original.
pub fn format_file(path: &Path) -> Result<(), ProcessError> {
    let ctx = Context::new();
    let text = std::fs::read_to_string(path)?;
    let directives = lexer::parse(&ctx, &path.to_string_lossy(), &text)?;

    let padding = printer::max_account_width(&ctx, &directives);
    let printer = Printer::with_padding(&ctx, padding);
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for directive in &directives {
        let range = directive.range();
        out.push_str(&text[pos..range.start]);
        out.push_str(&printer.directive(directive));
        pos = range.end;
    }
    out.push_str(&text[pos..]);
    if !out.ends_with('\n') {
        out.push('\n');
    }

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(out.as_bytes())?;
    tmp.persist(path).map_err(|e| ProcessError::Io(e.error))?;
    Ok(())
}
