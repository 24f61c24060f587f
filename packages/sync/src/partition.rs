//! Writing downloaded chunks into the partitioned output tree.

use std::path::{Path, PathBuf};

use pos_sync_interval::{DATE_FORMAT, DateInterval};
use pos_sync_portal::ReportKind;

/// Turns a branch name into a file-name-safe slug.
///
/// Accents are folded to ASCII, characters other than letters, digits, `_`,
/// `-` and whitespace are dropped, and runs of whitespace or hyphens become a
/// single `-`. Case is preserved. An empty result becomes `"unknown"`.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars().map(fold_accent) {
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
        } else if c.is_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        }
    }

    let slug = slug.trim_matches(|c| c == '-' || c == '_');
    if slug.is_empty() {
        "unknown".to_owned()
    } else {
        slug.to_owned()
    }
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ç' => 'c',
        'Ç' => 'C',
        other => other,
    }
}

/// `<Kind>_<branch-slug>_<start>_<end>.xlsx`
#[must_use]
pub fn output_file_name(kind: ReportKind, branch: &str, chunk: &DateInterval) -> String {
    format!(
        "{kind}_{}_{}_{}.xlsx",
        slugify(branch),
        chunk.start().format(DATE_FORMAT),
        chunk.end().format(DATE_FORMAT),
    )
}

/// Stores `bytes` as the file for `chunk` and returns its path.
///
/// The bytes go to a hidden temporary file next to the partition first; the
/// partition directory is only created once the write has succeeded, so an
/// interrupted download never shows up as coverage.
///
/// # Errors
///
/// Returns the underlying I/O error if any filesystem step fails.
pub fn write_partition(
    root: &Path,
    branch: &str,
    code: &str,
    kind: ReportKind,
    chunk: &DateInterval,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    let code_dir = root.join(branch).join(code);
    std::fs::create_dir_all(&code_dir)?;

    let tmp = code_dir.join(format!(".{chunk}.{}.part", std::process::id()));
    if let Err(e) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    let partition = pos_sync_coverage::partition_dir(root, branch, code, chunk);
    let path = partition.join(output_file_name(kind, branch, chunk));

    let moved = std::fs::create_dir_all(&partition).and_then(|()| std::fs::rename(&tmp, &path));
    if let Err(e) = moved {
        let _ = std::fs::remove_file(&tmp);
        let _ = std::fs::remove_dir(&partition);
        return Err(e);
    }

    Ok(path)
}
