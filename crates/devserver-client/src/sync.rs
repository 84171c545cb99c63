//! One-shot workspace sync
//!
//! Packs a local file or directory into a tar archive and unpacks it inside
//! the DevServer with `tar -xf -` over exec stdin. Call it after the server
//! reports `Running`.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crate::exec::devserver_pod_name;
use std::path::{Path, PathBuf};
use tracing::info;

const UNPACK_SCRIPT: &str = "mkdir -p \"$1\" && tar -xf - -C \"$1\"";

/// Build an in-memory tar archive of `path`.
///
/// A directory is archived by its contents; a single file keeps its file name.
pub fn build_archive(path: &Path) -> Result<Vec<u8>, ClientError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ClientError::Io(format!("{}: {}", path.display(), e)))?;

    let mut builder = tar::Builder::new(Vec::new());
    if metadata.is_dir() {
        builder.append_dir_all(".", path)?;
    } else {
        let name = path
            .file_name()
            .ok_or_else(|| ClientError::Validation(format!("{} has no file name", path.display())))?;
        builder.append_path_with_name(path, name)?;
    }
    Ok(builder.into_inner()?)
}

/// Copy `local` into `remote_dir` inside the DevServer.
pub async fn sync_workspace<C>(
    client: &C,
    namespace: &str,
    devserver: &str,
    local: &Path,
    remote_dir: &str,
) -> Result<(), ClientError>
where
    C: ClusterClientTrait + ?Sized,
{
    if !remote_dir.starts_with('/') {
        return Err(ClientError::Validation(format!(
            "remote path '{}' must be absolute",
            remote_dir
        )));
    }

    let source: PathBuf = local.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || build_archive(&source))
        .await
        .map_err(|e| ClientError::Io(e.to_string()))??;

    let command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        UNPACK_SCRIPT.to_string(),
        "sync".to_string(),
        remote_dir.to_string(),
    ];
    let size = archive.len();
    let result = client
        .exec(namespace, &devserver_pod_name(devserver), command, Some(archive))
        .await?;

    if !result.success() {
        return Err(ClientError::Exec(format!(
            "unpacking into {} exited with {}: {}",
            remote_dir,
            result.exit_code,
            result.stderr.trim()
        )));
    }

    info!(
        "Synced {} ({} bytes) to {}/{}:{}",
        local.display(),
        size,
        namespace,
        devserver,
        remote_dir
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClusterClient;
    use crate::models::ExecResult;
    use std::io::Read;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("devserver-sync-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();
        dir
    }

    fn entries(archive: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut archive = tar::Archive::new(archive);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().unwrap().to_string_lossy().trim_start_matches("./").to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            out.push((path, body));
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_sync_pipes_archive_into_tar() {
        let dir = scratch_dir();
        let client = MockClusterClient::new();

        sync_workspace(&client, "dev", "box", &dir, "/home/dev/project")
            .await
            .unwrap();

        let calls = client.exec_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].pod, "box-0");
        assert_eq!(calls[0].command.last().map(String::as_str), Some("/home/dev/project"));

        let files = entries(calls[0].stdin.as_deref().unwrap());
        assert_eq!(
            files,
            vec![
                ("README.md".to_string(), "hello".to_string()),
                ("src/main.rs".to_string(), "fn main() {}".to_string()),
            ]
        );

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_sync_reports_unpack_failure() {
        let dir = scratch_dir();
        let client = MockClusterClient::new();
        client.push_exec_result(ExecResult {
            stdout: String::new(),
            stderr: "tar: read-only file system".to_string(),
            exit_code: 2,
        });

        let err = sync_workspace(&client, "dev", "box", &dir, "/ro")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Exec(_)));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_sync_rejects_relative_destination() {
        let client = MockClusterClient::new();
        let err = sync_workspace(&client, "dev", "box", Path::new("."), "project")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(client.exec_calls().is_empty());
    }

    #[test]
    fn test_missing_local_path() {
        let missing = std::env::temp_dir().join(format!("devserver-missing-{}", uuid::Uuid::new_v4()));
        assert!(matches!(build_archive(&missing), Err(ClientError::Io(_))));
    }
}
