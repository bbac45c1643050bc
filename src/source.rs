//! Test unit sources
//!
//! A source yields each test unit descriptor exactly once, then signals the
//! end of the stream with `None`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

use crate::models::TestUnitDescriptor;

/// Lazy, finite stream of test units
#[async_trait]
pub trait TestUnitSource: Send {
    /// Next unit, or `None` once the source is exhausted
    async fn next_unit(&mut self) -> Option<TestUnitDescriptor>;
}

/// Source over any iterator of descriptors
pub struct IterSource<I> {
    units: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = TestUnitDescriptor> + Send,
{
    pub fn new<T>(units: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            units: units.into_iter(),
        }
    }
}

#[async_trait]
impl<I> TestUnitSource for IterSource<I>
where
    I: Iterator<Item = TestUnitDescriptor> + Send,
{
    async fn next_unit(&mut self) -> Option<TestUnitDescriptor> {
        self.units.next()
    }
}

/// Source fed by a channel, for discovery that streams units while the run
/// is already dispatching. Ends when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<TestUnitDescriptor>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<TestUnitDescriptor>) -> Self {
        Self { rx }
    }

    /// Bounded channel pair
    pub fn channel(capacity: usize) -> (mpsc::Sender<TestUnitDescriptor>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl TestUnitSource for ChannelSource {
    async fn next_unit(&mut self) -> Option<TestUnitDescriptor> {
        self.rx.recv().await
    }
}

/// Load a unit manifest.
///
/// `.json` holds an array of descriptors, `.yaml`/`.yml` a list of them.
/// Anything else is plain text: one class name per line, optionally
/// followed by comma-separated tags (`com.acme.OrderTest slow,db`). Blank
/// lines and `#` comments are skipped.
pub fn load_units(path: impl AsRef<Path>) -> Result<Vec<TestUnitDescriptor>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read unit manifest: {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON manifest: {}", path.display())),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML manifest: {}", path.display())),
        _ => Ok(parse_text_manifest(&content)),
    }
}

fn parse_text_manifest(content: &str) -> Vec<TestUnitDescriptor> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let tags = parts
                .flat_map(|chunk| chunk.split(','))
                .filter(|tag| !tag.is_empty());
            TestUnitDescriptor::new(name).with_tags(tags)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_iter_source_yields_each_unit_once() {
        let mut source = IterSource::new(vec![
            TestUnitDescriptor::new("a.A"),
            TestUnitDescriptor::new("a.B"),
        ]);

        assert_eq!(source.next_unit().await.unwrap().name(), "a.A");
        assert_eq!(source.next_unit().await.unwrap().name(), "a.B");
        assert!(source.next_unit().await.is_none());
        assert!(source.next_unit().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(TestUnitDescriptor::new("a.A")).await.unwrap();
        drop(tx);

        assert_eq!(source.next_unit().await.unwrap().name(), "a.A");
        assert!(source.next_unit().await.is_none());
    }

    #[test]
    fn test_text_manifest() {
        let units = parse_text_manifest(
            "# discovered classes\ncom.acme.OrderTest slow,db\n\n  com.acme.CartTest  \n",
        );
        assert_eq!(units.len(), 2);
        assert!(units[0].has_tag("slow"));
        assert!(units[0].has_tag("db"));
        assert!(units[1].tags().is_empty());
        assert_eq!(units[1].name(), "com.acme.CartTest");
    }

    #[test]
    fn test_load_yaml_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("units.yaml");
        std::fs::write(
            &path,
            "- id: com.acme.OrderTest\n  tags: [slow]\n- id: com.acme.CartTest\n",
        )
        .unwrap();

        let units = load_units(&path).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].has_tag("slow"));
    }

    #[test]
    fn test_load_missing_manifest() {
        assert!(load_units("/definitely/not/here.txt").is_err());
    }
}
