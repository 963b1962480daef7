//! Durable staging of configuration documents.
//!
//! Each management node persists one file per committed generation, named deterministically
//! from its node ID and the generation. While a change is in flight the candidate lives in a
//! `.tmp` sibling which is fsynced before the node acknowledges a Prepare, and atomically
//! renamed on Commit. A `.tmp` file found at startup is the residue of an interrupted change
//! and blocks the process from starting until an operator resolves it.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::{ERR_STAGING_FSYNC, ERR_STAGING_WRITE};
use crate::model::ConfigDocument;
use crate::NodeId;

/// The default path to use for configuration storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/mgmtd/data";

/// The suffix marking a staged, not yet committed, configuration file.
const TMP_SUFFIX: &str = ".tmp";

/// The default path to use for configuration storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// The crash safe staging store for the local node's configuration files.
pub struct StagingStore {
    /// The directory holding this node's configuration files.
    dir: PathBuf,
    /// The ID of the local node.
    node_id: NodeId,
    /// The staged file paths of the in-flight change, if any.
    staged: Option<StagedPaths>,
}

/// The file paths of a staged configuration change.
struct StagedPaths {
    /// The `.tmp` staging path.
    tmp: PathBuf,
    /// The final path the staged file is renamed to on commit.
    committed: PathBuf,
}

impl StagingStore {
    /// Open the store, refusing to start when residue of an interrupted change is present.
    pub async fn open(config: &Config) -> Result<Self> {
        let dir = PathBuf::from(&config.storage_data_path);
        fs::create_dir_all(&dir).await.context("error creating configuration storage directory")?;
        let this = Self { dir, node_id: config.node_id, staged: None };
        if let Some(tmp) = this.find_tmp_residue().await? {
            bail!(
                "unresolved configuration change found at {}: a previous change was interrupted; \
                 remove the file to roll the change back, or strip its .tmp suffix to commit it",
                tmp.display(),
            );
        }
        Ok(this)
    }

    /// Durably stage the given candidate document, leaving no renamed file behind on error.
    pub async fn stage(&mut self, doc: &ConfigDocument) -> Result<()> {
        let committed = self.dir.join(self.file_name(doc.generation));
        let tmp = self.dir.join(format!("{}{}", self.file_name(doc.generation), TMP_SUFFIX));
        for residue in [&committed, &tmp] {
            if fs::metadata(residue).await.is_ok() {
                bail!("refusing to stage configuration generation {}, {} already exists", doc.generation, residue.display());
            }
        }

        let buf = serde_json::to_vec_pretty(doc).context("error serializing configuration document")?;
        if let Err(err) = Self::write_and_sync(&tmp, &buf).await {
            // Leave nothing behind on a failed write.
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        self.staged = Some(StagedPaths { tmp, committed });
        Ok(())
    }

    /// Atomically promote the staged file to its final name.
    ///
    /// An error here is unrecoverable for the caller: the node has already acknowledged that
    /// it can honor a Commit, so disk and memory must not be allowed to diverge. The `.tmp`
    /// file is deliberately left in place for operator diagnosis.
    pub async fn commit(&mut self) -> Result<()> {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => bail!("no staged configuration to commit"),
        };
        fs::rename(&staged.tmp, &staged.committed)
            .await
            .with_context(|| format!("error renaming staged configuration {} into place", staged.tmp.display()))?;
        Ok(())
    }

    /// Delete the staged file, if any. Safe to call when nothing is staged.
    pub async fn abort(&mut self) -> Result<()> {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => return Ok(()),
        };
        match fs::remove_file(&staged.tmp).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error removing staged configuration {}", staged.tmp.display())),
        }
    }

    /// Recover the committed document with the highest generation, if any exists on disk.
    pub async fn recover_latest(&self) -> Result<Option<ConfigDocument>> {
        let mut newest: Option<(u64, PathBuf)> = None;
        let mut entries = fs::read_dir(&self.dir).await.context("error scanning configuration storage directory")?;
        while let Some(entry) = entries.next_entry().await.context("error scanning configuration storage directory")? {
            let name = entry.file_name().to_string_lossy().to_string();
            let generation = match self.parse_committed_generation(&name) {
                Some(generation) => generation,
                None => continue,
            };
            if newest.as_ref().map(|(gen, _)| generation > *gen).unwrap_or(true) {
                newest = Some((generation, entry.path()));
            }
        }
        let (generation, path) = match newest {
            Some(newest) => newest,
            None => return Ok(None),
        };
        let buf = fs::read(&path).await.with_context(|| format!("error reading committed configuration {}", path.display()))?;
        let doc: ConfigDocument = serde_json::from_slice(&buf).with_context(|| format!("error parsing committed configuration {}", path.display()))?;
        if doc.generation != generation {
            bail!("committed configuration {} carries generation {} but is named for generation {}", path.display(), doc.generation, generation);
        }
        Ok(Some(doc))
    }

    /// Write the given bytes to the given path and fsync them to disk.
    async fn write_and_sync(path: &PathBuf, buf: &[u8]) -> Result<()> {
        let mut file = fs::File::create(path).await.context(ERR_STAGING_WRITE)?;
        file.write_all(buf).await.context(ERR_STAGING_WRITE)?;
        file.sync_all().await.context(ERR_STAGING_FSYNC)?;
        Ok(())
    }

    /// The deterministic file name of the local node's document at the given generation.
    fn file_name(&self, generation: u64) -> String {
        format!("mgmt_{}_config_v{}.json", self.node_id, generation)
    }

    /// Parse the generation out of a committed file name matching the local naming pattern.
    fn parse_committed_generation(&self, name: &str) -> Option<u64> {
        name.strip_prefix(&format!("mgmt_{}_config_v", self.node_id))
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|generation| generation.parse().ok())
    }

    /// Search the storage directory for a `.tmp` file matching the local naming pattern.
    async fn find_tmp_residue(&self) -> Result<Option<PathBuf>> {
        let prefix = format!("mgmt_{}_config_v", self.node_id);
        let mut entries = fs::read_dir(&self.dir).await.context("error scanning configuration storage directory")?;
        while let Some(entry) = entries.next_entry().await.context("error scanning configuration storage directory")? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(TMP_SUFFIX) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}
