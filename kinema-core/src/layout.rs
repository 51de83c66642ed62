use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Subdirectory of the transcoded root holding episode assets.
pub const SERIES_SUBDIR: &str = "series";

static EPISODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)S\d{1,2}E\d{1,2}").expect("valid episode pattern"));

/// Whether a source looks like a TV episode: either the filename carries an
/// `SxxEyy` tag or the file lives inside the series root.
pub fn is_episode(source: &Path, series_root: &Path) -> bool {
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    EPISODE_PATTERN.is_match(&filename) || source.starts_with(series_root)
}

/// Map a source path to its output directory under the transcoded root.
///
/// Total, deterministic and side-effect-free: the returned path never
/// escapes `transcoded_root`.
pub fn output_dir(transcoded_root: &Path, series_root: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = safe_name(&stem);

    if is_episode(source, series_root) {
        transcoded_root.join(SERIES_SUBDIR).join(name)
    } else {
        transcoded_root.join(name)
    }
}

/// Replace every character outside the allowed set with an underscore.
///
/// Kept: ASCII alphanumerics, whitespace, `-_.()[]` and common accented
/// letters, so directory names stay readable for typical library naming.
pub fn safe_name(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            let keep = c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '-' | '_' | '.' | '(' | ')' | '[' | ']')
                || matches!(c, 'à'..='ö' | 'ø'..='ÿ' | 'À'..='Ö' | 'Ø'..='Þ');
            if keep { c } else { '_' }
        })
        .collect()
}
