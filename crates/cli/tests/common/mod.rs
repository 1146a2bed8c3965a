//! Common utilities for integration tests

pub mod cli;

use std::path::{Path, PathBuf};

/// Write a minimal configuration rooted at `root` and return its path
pub fn write_config(dir: &Path, root: &Path, server: &str, backend: &str) -> PathBuf {
    let path = dir.join("pacs-retire.toml");
    let text = format!(
        r#"
server_address = "{server}"
retention_window_days = 180
archive_root_path = "{root}"
database_backend = "{backend}"

[source]
request_timeout_secs = 2

[pipeline]
build_attempts = 1
"#,
        server = server,
        root = root.display(),
        backend = backend,
    );
    std::fs::write(&path, text).unwrap();
    path
}
