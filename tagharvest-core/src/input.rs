//! Where a run's tag list comes from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{HarvestError, Result};
use crate::types::TagId;

/// Loads the ordered tag list once at the start of every run.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn load(&self) -> Result<Vec<TagId>>;
}

/// Parse one tag per line. Lines are trimmed and blank lines skipped.
pub fn parse_tag_list(contents: &str) -> Vec<TagId> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(TagId::from)
        .collect()
}

/// Plain text file with one tag per line.
#[derive(Clone, Debug)]
pub struct TagListFile {
    path: PathBuf,
}

impl TagListFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TagSource for TagListFile {
    async fn load(&self) -> Result<Vec<TagId>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            HarvestError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to read tag list {:?}: {err}", self.path),
            ))
        })?;
        let tags = parse_tag_list(&contents);
        tracing::info!(
            target: "harvest::runtime",
            path = %self.path.display(),
            count = tags.len(),
            "loaded tag list"
        );
        Ok(tags)
    }
}

/// Fixed tag list, used by the demo mode and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticTags {
    tags: Vec<TagId>,
}

impl StaticTags {
    pub fn new<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TagId>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TagSource for StaticTags {
    async fn load(&self) -> Result<Vec<TagId>> {
        Ok(self.tags.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_trimmed_and_blanks_skipped() {
        let tags = parse_tag_list("  A  \n\n\tB\r\n   \nC");
        assert_eq!(tags, vec![TagId::from("A"), TagId::from("B"), TagId::from("C")]);
    }

    #[tokio::test]
    async fn reads_tags_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tags.txt");
        tokio::fs::write(&path, "ns=2;s=Pump.Speed\n\nns=2;s=Pump.State\n")
            .await
            .expect("write tag list");

        let tags = TagListFile::new(&path).load().await.expect("load");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].as_str(), "ns=2;s=Pump.State");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = TagListFile::new(dir.path().join("absent.txt"))
            .load()
            .await
            .expect_err("missing file");
        assert!(matches!(err, HarvestError::Io(_)));
    }
}
