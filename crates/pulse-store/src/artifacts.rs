use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use pulse_core::{PulseError, Result};

/// On-disk storage for uploaded target artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// A stored upload: the sanitised name and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub file_name: String,
    pub path: PathBuf,
}

impl ArtifactStore {
    /// Use `root` as the artifact directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under the sanitised form of `original_name`, replacing
    /// any previous upload of the same name.
    pub fn save(&self, original_name: &str, bytes: &[u8]) -> Result<StoredArtifact> {
        let file_name = sanitize_file_name(original_name);
        let path = self.root.join(&file_name);

        let tmp = self.root.join(format!(".{file_name}.part"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        info!(file_name = %file_name, size = bytes.len(), "artifact stored");
        Ok(StoredArtifact { file_name, path })
    }

    /// Path of a previously stored artifact.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.root.join(sanitize_file_name(file_name));
        if path.is_file() {
            Ok(path)
        } else {
            Err(PulseError::NotFound {
                entity: "Artifact",
                id: file_name.to_string(),
            })
        }
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.resolve(file_name).is_ok()
    }
}

/// Reduce an uploaded name to a safe basename.
///
/// Directory components (either separator) are dropped, characters outside
/// `[A-Za-z0-9._-]` become `_`, and leading dots are stripped so the result
/// can never be hidden or escape the artifact directory.
///
/// ```
/// use pulse_store::artifacts::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("C:\\Users\\me\\evil app.exe"), "evil_app.exe");
/// assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
/// assert_eq!(sanitize_file_name(".."), "artifact");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("regex is valid"));

    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = unsafe_chars.replace_all(base.trim(), "_");
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned.to_string()
    }
}
