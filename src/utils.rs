use crate::error::AppError;
use percent_encoding::percent_decode_str;

/// Turns a request target into a root-relative path such as `docs/a.txt`.
///
/// The query string and fragment are dropped, percent escapes are decoded
/// before any segment handling, and `.`/`..`/empty segments are collapsed.
/// A `..` that would climb above the root is a `PathTraversal`, so encoded
/// forms like `%2e%2e%2f` cannot sneak past. The document root itself
/// normalizes to the empty string.
pub fn normalize_request_path(target: &str) -> Result<String, AppError> {
    let path = target
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    if !path.starts_with('/') {
        return Err(AppError::BadRequest);
    }

    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| AppError::BadRequest)?;

    if decoded.contains('\0') {
        return Err(AppError::BadRequest);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(AppError::PathTraversal);
                }
            }
            other => segments.push(other),
        }
    }

    Ok(segments.join("/"))
}
