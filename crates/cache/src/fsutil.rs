//! Small filesystem helpers shared by the caches.

use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write a file atomically: temp name, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    let temp_path = path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    );
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await
}
