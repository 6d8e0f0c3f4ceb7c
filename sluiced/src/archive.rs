//! SYNC archive files.
//!
//! With `-a DIR` every applied SYNC group is also written out as a SQL
//! script for external consumption (log shipping). One file per group,
//! named after the origin and the last event sequence it covers.

use crate::error::DaemonResult;
use sluice_domain::{EventSeq, NodeId};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes one SQL script per applied SYNC group.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    dir: PathBuf,
    cluster: String,
}

impl ArchiveWriter {
    /// Archive into `dir`, creating it if missing.
    pub async fn new(dir: impl Into<PathBuf>, cluster: &str) -> DaemonResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            cluster: cluster.to_string(),
        })
    }

    /// The file a group archive lands in.
    pub fn group_path(&self, origin: NodeId, last_seqno: EventSeq) -> PathBuf {
        self.dir.join(format!(
            "sluice_log_{}_{:020}.sql",
            origin.as_i32(),
            last_seqno.as_i64()
        ))
    }

    /// Write the statements of one applied SYNC group.
    pub async fn write_group(
        &self,
        origin: NodeId,
        last_seqno: EventSeq,
        statements: &[String],
    ) -> DaemonResult<PathBuf> {
        let path = self.group_path(origin, last_seqno);
        let mut script = String::with_capacity(256 + statements.iter().map(String::len).sum::<usize>());
        script.push_str(&format!(
            "-- sluice archive: cluster {}, origin {}, through event {}\n",
            self.cluster, origin, last_seqno
        ));
        script.push_str("start transaction;\n");
        for statement in statements {
            script.push_str(statement);
            script.push_str(";\n");
        }
        script.push_str("commit;\n");

        write_atomic(&path, script.as_bytes()).await?;
        debug!(path = %path.display(), statements = statements.len(), "Wrote SYNC archive");
        Ok(path)
    }
}

/// Write via a temp file and rename so consumers never see a torn script.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("sql.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: i32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_write_group_produces_script() {
        let dir = std::env::temp_dir().join(format!("sluice-archive-{}", std::process::id()));
        let writer = ArchiveWriter::new(&dir, "payroll").await.unwrap();

        let statements = vec![
            "insert into accounts (k,v) values ('1','a')".to_string(),
            "delete from accounts where k='1'".to_string(),
        ];
        let path = writer
            .write_group(node(2), EventSeq(31), &statements)
            .await
            .unwrap();

        let script = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(script.starts_with("-- sluice archive: cluster payroll, origin 2"));
        assert!(script.contains("start transaction;\n"));
        assert!(script.contains("insert into accounts"));
        assert!(script.ends_with("commit;\n"));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sluice_log_2_"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_group_path_padding() {
        let writer = ArchiveWriter {
            dir: PathBuf::from("/tmp"),
            cluster: "c".into(),
        };
        let path = writer.group_path(node(3), EventSeq(42));
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "sluice_log_3_00000000000000000042.sql"
        );
    }
}
