//! Kernel source loading.

use std::path::Path;

use crate::error::{DispatchError, Result};

/// Read kernel source text from `path`.
pub fn load_kernel_source(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|source| DispatchError::SourceLoad {
        path: path.to_path_buf(),
        source,
    })
}
