use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use crate::chain_client::BlockRecord;

use super::super::types::PersistError;
use super::persister::BlockPersister;

/// Filesystem-backed block persister writing one file per height.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so readers
/// never observe a partially written block file. A height whose final file
/// already exists is a no-op, which makes replays and gap repair idempotent.
pub struct FileBlockPersister {
    dir: PathBuf,
    extension: Option<String>,
    pretty: bool,
}

impl FileBlockPersister {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: Option<String>,
        pretty: bool,
    ) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| {
            PersistError::fatal(format!(
                "failed to create block output directory {}: {err}",
                dir.display()
            ))
        })?;

        Ok(Self {
            dir,
            extension: extension.filter(|ext| !ext.is_empty()),
            pretty,
        })
    }

    fn file_name(&self, height: i64) -> String {
        match &self.extension {
            Some(ext) => format!("{height}.{ext}"),
            None => height.to_string(),
        }
    }

    pub fn block_path(&self, height: i64) -> PathBuf {
        self.dir.join(self.file_name(height))
    }

    fn tmp_path(&self, height: i64) -> PathBuf {
        self.dir.join(format!("{}.tmp", self.file_name(height)))
    }

    fn encode(&self, block: &BlockRecord) -> Result<Vec<u8>, PersistError> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(block)
        } else {
            serde_json::to_vec(block)
        };
        encoded.map_err(|err| {
            PersistError::fatal(format!(
                "failed to serialize block {} for file storage: {err}",
                block.height
            ))
        })
    }
}

async fn remove_quietly(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

impl BlockPersister for FileBlockPersister {
    fn persist_block<'a>(
        &'a self,
        block: &'a BlockRecord,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let final_path = self.block_path(block.height);
            match tokio::fs::try_exists(&final_path).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    return Err(PersistError::retryable(format!(
                        "failed to stat {}: {err}",
                        final_path.display()
                    )))
                }
            }

            let payload = self.encode(block)?;
            let tmp_path = self.tmp_path(block.height);

            if let Err(err) = tokio::fs::write(&tmp_path, &payload).await {
                remove_quietly(&tmp_path).await;
                return Err(PersistError::retryable(format!(
                    "failed to write {}: {err}",
                    tmp_path.display()
                )));
            }

            if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
                remove_quietly(&tmp_path).await;
                return Err(PersistError::retryable(format!(
                    "failed to rename {} into place: {err}",
                    tmp_path.display()
                )));
            }

            Ok(())
        })
    }
}
