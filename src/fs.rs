use crate::cache::{FileKind, MetadataCache, ResolvedFile};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::utils::normalize_request_path;
use glob::Pattern;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_INDEX: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>static-server</title>
  <link rel="stylesheet" href="style.css">
</head>
<body>
  <main>
    <h1>It works</h1>
    <p>This page was generated because the document root did not exist.
       Replace it with your own content.</p>
  </main>
</body>
</html>
"#;

const DEFAULT_STYLE: &str = r#"body {
  margin: 0;
  font-family: system-ui, sans-serif;
  background: #f4f4f2;
  color: #222;
}

main {
  max-width: 40rem;
  margin: 4rem auto;
  padding: 0 1rem;
}
"#;

/// Creates a missing document root and seeds it with a starter page.
///
/// Only a path that does not exist at all is created. Existing files are
/// never overwritten, and a root that exists but is not a directory is left
/// for `FileResolver::new` to reject.
pub fn prepare_document_root(root: &Path, index_file: &str) -> Result<(), AppError> {
    match fs::symlink_metadata(root) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(AppError::Io(e)),
    }

    fs::create_dir_all(root)?;
    let created = write_new(&root.join(index_file), DEFAULT_INDEX)?
        | write_new(&root.join("style.css"), DEFAULT_STYLE)?;
    if created {
        info!("Created document root '{}' with a default page", root.display());
    } else {
        info!("Created document root '{}'", root.display());
    }
    Ok(())
}

/// Writes `contents` only if `path` does not exist yet.
fn write_new(path: &Path, contents: &str) -> Result<bool, AppError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(AppError::Io(e)),
    }
}

/// Maps request targets to files beneath a canonical document root.
#[derive(Debug)]
pub struct FileResolver {
    root: PathBuf,
    index_file: String,
    deny: Vec<Pattern>,
    max_file_size: Option<u64>,
}

impl FileResolver {
    pub fn new(config: &ServerConfig) -> Result<Self, AppError> {
        let root = config.directory.canonicalize().map_err(|_| {
            AppError::DirectoryNotFound(config.directory.to_string_lossy().into_owned())
        })?;
        if !is_directory(&root)? {
            return Err(AppError::DirectoryNotFound(
                config.directory.to_string_lossy().into_owned(),
            ));
        }

        let deny = config
            .deny
            .iter()
            .map(|pattern| Pattern::new(pattern.trim()))
            .collect::<Result<Vec<Pattern>, _>>()?;

        Ok(Self {
            root,
            index_file: config.index_file.clone(),
            deny,
            max_file_size: config.max_file_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a raw request target to cached file metadata.
    ///
    /// Containment is checked on the canonical path, after symlinks are
    /// followed, so a link pointing outside the root is refused even though
    /// its textual path looks harmless. Every `stat` goes through `cache`,
    /// so concurrent cold lookups of one path share a single refresh.
    pub fn resolve(
        &self,
        target: &str,
        cache: &MetadataCache,
        log_prefix: &str,
    ) -> Result<Arc<ResolvedFile>, AppError> {
        let relative = normalize_request_path(target).inspect_err(|e| {
            if matches!(e, AppError::PathTraversal) {
                warn!("{log_prefix} Potential path traversal attempt: '{target}'");
            }
        })?;

        if self.deny.iter().any(|pattern| pattern.matches(&relative)) {
            debug!("{log_prefix} '{relative}' matches a deny pattern");
            return Err(AppError::Forbidden);
        }

        let mut key = relative;
        let canonical = self.contained(&self.root.join(&key), log_prefix)?;
        let mut entry = cache
            .get_or_refresh(&key, &canonical)
            .map_err(map_lookup_error)?;

        match entry.kind {
            FileKind::File => {}
            FileKind::Directory => {
                key = if key.is_empty() {
                    self.index_file.clone()
                } else {
                    format!("{key}/{}", self.index_file)
                };
                let index = self.contained(&canonical.join(&self.index_file), log_prefix)?;
                entry = cache.get_or_refresh(&key, &index).map_err(map_lookup_error)?;
                if entry.kind != FileKind::File {
                    return Err(AppError::NotFound);
                }
            }
            FileKind::Other => {
                debug!("{log_prefix} '{key}' is not a regular file");
                return Err(AppError::Forbidden);
            }
        }

        if let Some(limit) = self.max_file_size {
            if entry.len > limit {
                warn!(
                    "{log_prefix} '{key}' is {} which exceeds the {} limit",
                    humansize::format_size(entry.len, humansize::BINARY),
                    humansize::format_size(limit, humansize::BINARY)
                );
                return Err(AppError::FileTooLarge);
            }
        }

        Ok(entry)
    }

    fn contained(&self, path: &Path, log_prefix: &str) -> Result<PathBuf, AppError> {
        let canonical = path.canonicalize().map_err(map_lookup_error)?;
        if !canonical.starts_with(&self.root) {
            warn!(
                "{log_prefix} Resolved path escapes the document root: '{}'",
                canonical.display()
            );
            return Err(AppError::PathTraversal);
        }
        Ok(canonical)
    }
}

pub fn is_directory(path: &Path) -> Result<bool, AppError> {
    Ok(fs::metadata(path)?.is_dir())
}

/// Lookup failures become client errors. Anything other than a permission
/// problem means there is nothing servable at that path (missing entry,
/// a file used as a directory, a dangling link).
fn map_lookup_error(err: io::Error) -> AppError {
    match err.kind() {
        ErrorKind::PermissionDenied => AppError::Forbidden,
        _ => AppError::NotFound,
    }
}
