use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flatwatch_adapters::SegmentRef;
use serde::Deserialize;
use tracing::warn;

use crate::config::EnvType;

/// Chat or channel identifier understood by the notifier.
pub type Recipient = i64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentInfo {
    pub id: i64,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

impl SegmentInfo {
    pub fn segment_ref(&self) -> SegmentRef {
        SegmentRef {
            id: self.id,
            slug: self.slug.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub chat_id: Recipient,
    pub segment: String,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    segments: Vec<SegmentInfo>,
    #[serde(default)]
    subscriptions: BTreeMap<EnvType, Vec<Subscription>>,
}

/// Every segment the process knows about, keyed by slug.
#[derive(Debug, Clone, Default)]
pub struct SegmentCatalog {
    segments: BTreeMap<String, SegmentInfo>,
}

impl SegmentCatalog {
    pub fn new(segments: impl IntoIterator<Item = SegmentInfo>) -> Result<Self> {
        let mut by_slug = BTreeMap::new();
        for segment in segments {
            if segment.slug.trim().is_empty() {
                bail!("segment {} has an empty slug", segment.id);
            }
            if !segment
                .slug
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            {
                bail!("segment {} has an unusable slug {:?}", segment.id, segment.slug);
            }
            if let Some(previous) = by_slug.insert(segment.slug.clone(), segment) {
                bail!("segment slug {:?} is listed twice", previous.slug);
            }
        }
        Ok(Self { segments: by_slug })
    }

    pub fn all_known_segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.values()
    }

    pub fn get(&self, slug: &str) -> Option<&SegmentInfo> {
        self.segments.get(slug)
    }

    pub fn id_for(&self, slug: &str) -> Option<i64> {
        self.get(slug).map(|segment| segment.id)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Read-only view of who is subscribed to which segment in the active environment.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionDirectory {
    by_segment: BTreeMap<String, Vec<Recipient>>,
}

impl SubscriptionDirectory {
    pub fn new(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let mut by_segment: BTreeMap<String, Vec<Recipient>> = BTreeMap::new();
        for sub in subscriptions {
            let recipients = by_segment.entry(sub.segment).or_default();
            if !recipients.contains(&sub.chat_id) {
                recipients.push(sub.chat_id);
            }
        }
        Self { by_segment }
    }

    pub fn list_subscribers(&self, slug: &str) -> Vec<Recipient> {
        self.by_segment.get(slug).cloned().unwrap_or_default()
    }

    pub fn all_recipients(&self) -> Vec<Recipient> {
        self.by_segment
            .values()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn subscribed_segments(&self) -> impl Iterator<Item = (&str, &[Recipient])> {
        self.by_segment
            .iter()
            .filter(|(_, recipients)| !recipients.is_empty())
            .map(|(slug, recipients)| (slug.as_str(), recipients.as_slice()))
    }
}

pub fn parse_registry(text: &str, env: EnvType) -> Result<(SegmentCatalog, SubscriptionDirectory)> {
    let mut file: RegistryFile = serde_yaml::from_str(text).context("parsing segment registry")?;
    let catalog = SegmentCatalog::new(file.segments)?;

    let subscriptions = file.subscriptions.remove(&env).unwrap_or_default();
    let known = subscriptions.into_iter().filter(|sub| {
        let is_known = catalog.get(&sub.segment).is_some();
        if !is_known {
            warn!(segment = %sub.segment, chat_id = sub.chat_id, %env, "subscription to unknown segment ignored");
        }
        is_known
    });
    let directory = SubscriptionDirectory::new(known);
    Ok((catalog, directory))
}

pub fn load_registry(path: &Path, env: EnvType) -> Result<(SegmentCatalog, SubscriptionDirectory)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_registry(&text, env).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
segments:
  - id: 1240
    slug: 2ngt
    name: Second Nagatinsky
  - id: 180
    slug: kuzminskyles
    name: Kuzminsky Forest
  - id: 7
    slug: mnevniki
subscriptions:
  dev:
    - chat_id: 100
      segment: 2ngt
    - chat_id: 100
      segment: 2ngt
    - chat_id: 200
      segment: 2ngt
    - chat_id: 300
      segment: kuzminskyles
    - chat_id: 400
      segment: vanished
  prod:
    - chat_id: -1001
      segment: mnevniki
"#;

    #[test]
    fn registry_loads_catalog_and_environment_subscriptions() {
        let (catalog, directory) = parse_registry(REGISTRY, EnvType::Dev).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.id_for("2ngt"), Some(1240));
        assert_eq!(catalog.get("mnevniki").unwrap().name, "");
        assert_eq!(catalog.id_for("nope"), None);

        assert_eq!(directory.list_subscribers("2ngt"), vec![100, 200]);
        assert!(directory.list_subscribers("mnevniki").is_empty());
        assert_eq!(directory.all_recipients(), vec![100, 200, 300]);
        assert_eq!(directory.subscribed_segments().count(), 2);
    }

    #[test]
    fn other_environments_are_isolated() {
        let (_, directory) = parse_registry(REGISTRY, EnvType::Prod).unwrap();
        assert_eq!(directory.all_recipients(), vec![-1001]);
        let (_, directory) = parse_registry(REGISTRY, EnvType::Test).unwrap();
        assert!(directory.all_recipients().is_empty());
    }

    #[test]
    fn duplicate_slugs_are_rejected() {
        let text = "segments:\n  - {id: 1, slug: a}\n  - {id: 2, slug: a}\n";
        assert!(parse_registry(text, EnvType::Dev).is_err());
    }

    #[test]
    fn slugs_with_path_characters_are_rejected() {
        for slug in ["../secret", "a/b", "."] {
            let segment = SegmentInfo {
                id: 1,
                slug: slug.into(),
                name: String::new(),
            };
            assert!(SegmentCatalog::new([segment]).is_err(), "{slug}");
        }
    }
}
