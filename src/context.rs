//! Image build contexts.
//!
//! A build context is a directory holding everything the runtime needs to
//! build one tool image:
//!
//! ```text
//! <context>/
//! ├── Dockerfile          # layers the base runtime, installs, copies source
//! ├── requirements.txt    # dependency manifest
//! └── app.py              # entry point
//! ```
//!
//! Contexts for the build job live in a [`tempfile::TempDir`] and are removed
//! when the [`BuildContext`] is dropped, whether the build succeeded or not.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::constants::{DOCKERFILE_NAME, ENTRYPOINT_FILE, IMAGE_WORKDIR, MANIFEST_FILE};
use crate::error::Result;

/// Renders the image descriptor for `base_image`.
///
/// The manifest is copied and installed before the source, so editing only
/// `app.py` reuses the dependency layer.
pub fn render_dockerfile(base_image: &str) -> String {
    format!(
        "FROM {base}\n\
         WORKDIR {workdir}\n\
         COPY {manifest} {manifest}\n\
         RUN pip install --no-cache-dir -r {manifest}\n\
         COPY {entry} {entry}\n",
        base = base_image,
        workdir = IMAGE_WORKDIR,
        manifest = MANIFEST_FILE,
        entry = ENTRYPOINT_FILE,
    )
}

/// Writes the three context files into `dir`, which must exist.
pub fn write_context(dir: &Path, base_image: &str, source: &str, manifest: &str) -> Result<()> {
    fs::write(dir.join(ENTRYPOINT_FILE), source)?;
    fs::write(dir.join(MANIFEST_FILE), manifest)?;
    fs::write(dir.join(DOCKERFILE_NAME), render_dockerfile(base_image))?;
    debug!("wrote build context to {}", dir.display());
    Ok(())
}

/// An ephemeral build context, deleted on drop.
#[derive(Debug)]
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    /// Materializes a fresh context under the system temp directory.
    pub fn create(base_image: &str, source: &str, manifest: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("sheetify-build-").tempdir()?;
        write_context(dir.path(), base_image, source, manifest)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the generated Dockerfile.
    pub fn dockerfile(&self) -> PathBuf {
        self.dir.path().join(DOCKERFILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dockerfile_layers() {
        let rendered = render_dockerfile("python:3.11-slim");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "FROM python:3.11-slim",
                "WORKDIR /workspace",
                "COPY requirements.txt requirements.txt",
                "RUN pip install --no-cache-dir -r requirements.txt",
                "COPY app.py app.py",
            ]
        );
    }

    #[test]
    fn test_context_removed_on_drop() {
        let ctx = BuildContext::create("base:1", "import pandas\n", "streamlit>=1.32\npandas").unwrap();
        let root = ctx.path().to_path_buf();
        assert_eq!(fs::read_to_string(root.join("app.py")).unwrap(), "import pandas\n");
        assert_eq!(
            fs::read_to_string(root.join("requirements.txt")).unwrap(),
            "streamlit>=1.32\npandas"
        );
        assert!(ctx.dockerfile().exists());

        drop(ctx);
        assert!(!root.exists());
    }
}
