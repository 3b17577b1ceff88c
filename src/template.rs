//! Block template cache
//!
//! Holds the latest work package fetched from the active upstream. A template
//! is replaced wholesale; readers get an `Arc` to a complete value and never
//! wait on a fetch.

use crate::difficulty::target_to_difficulty;
use crate::upstream::{UpstreamPool, bounded};
use crate::utils::{decode_hex_fixed, parse_hex_quantity, short_hash};
use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// One unit of mining work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockTemplate {
    /// Header hash miners work on
    pub header: String,
    /// Seed hash for the PoW dataset
    pub seed: String,
    /// Block boundary
    pub target: String,
    /// `2^256 / target`
    pub difficulty: u128,
    /// Block number, when the node reports one
    pub height: Option<u64>,
    pub fetched_at: DateTime<Utc>,
}

impl BlockTemplate {
    /// Build a template from a getWork reply `[header, seed, target, height?]`
    pub fn from_work(work: &[String]) -> Result<Self> {
        let [header, seed, target, rest @ ..] = work else {
            return Err(Error::work(format!(
                "work package has {} fields",
                work.len()
            )));
        };

        decode_hex_fixed(header, 32)
            .map_err(|e| Error::work(format!("invalid header: {}", e)))?;
        decode_hex_fixed(seed, 32).map_err(|e| Error::work(format!("invalid seed: {}", e)))?;
        let difficulty = target_to_difficulty(target)?;

        let height = rest
            .first()
            .and_then(|h| parse_hex_quantity(h).ok())
            .and_then(|h| u64::try_from(h).ok());

        Ok(Self {
            header: header.to_lowercase(),
            seed: seed.to_lowercase(),
            target: target.to_lowercase(),
            difficulty,
            height,
            fetched_at: Utc::now(),
        })
    }

    /// Reply to a miner's getWork, optionally with an overriding target
    pub fn work_reply(&self, target: Option<&str>) -> [String; 3] {
        [
            self.header.clone(),
            self.seed.clone(),
            target.unwrap_or(&self.target).to_string(),
        ]
    }
}

/// Shared holder of the current template
#[derive(Debug, Default)]
pub struct TemplateCache {
    current: ArcSwapOption<BlockTemplate>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current template, `None` until the first successful fetch
    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.current.load_full()
    }

    /// Publish a template unless it carries the header already cached.
    ///
    /// Returns whether the cached value changed.
    pub fn publish(&self, template: BlockTemplate) -> bool {
        let current = self.current.load();
        if matches!(&*current, Some(t) if t.header == template.header) {
            return false;
        }

        match template.height {
            Some(height) => info!(
                height,
                header = short_hash(&template.header),
                difficulty = %template.difficulty,
                "New block to mine"
            ),
            None => info!(
                header = short_hash(&template.header),
                difficulty = %template.difficulty,
                "New block to mine"
            ),
        }
        self.current.store(Some(Arc::new(template)));
        true
    }

    /// Fetch work from the active upstream.
    ///
    /// Failures are logged and reported to the pool; the previous template
    /// stays in place.
    pub async fn fetch(&self, pool: &UpstreamPool) -> Result<bool> {
        let index = pool.active_index();
        let upstream = pool.active();

        let result = bounded(upstream.as_ref(), upstream.get_work())
            .await
            .and_then(|work| BlockTemplate::from_work(&work));

        match result {
            Ok(template) => Ok(self.publish(template)),
            Err(e) => {
                if e.is_upstream_fault() {
                    pool.record_failure(index);
                }
                warn!(
                    upstream = upstream.name(),
                    kind = e.category(),
                    error = %e,
                    "Error while refreshing block template"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: char) -> String {
        format!("0x{}", byte.to_string().repeat(64))
    }

    fn work(header: char) -> Vec<String> {
        vec![
            hash(header),
            hash('b'),
            format!("0x00000001{}", "0".repeat(56)),
            "0x1a".to_string(),
        ]
    }

    #[test]
    fn test_from_work() {
        let template = BlockTemplate::from_work(&work('a')).unwrap();
        assert_eq!(template.header, hash('a'));
        assert_eq!(template.difficulty, 1u128 << 32);
        assert_eq!(template.height, Some(26));

        let no_height = BlockTemplate::from_work(&work('a')[..3]).unwrap();
        assert_eq!(no_height.height, None);
    }

    #[test]
    fn test_from_work_rejects_malformed() {
        assert!(BlockTemplate::from_work(&work('a')[..2]).is_err());

        let mut bad = work('a');
        bad[0] = "0x1234".to_string();
        assert!(BlockTemplate::from_work(&bad).is_err());

        let mut bad = work('a');
        bad[2] = format!("0x{}", "0".repeat(64));
        assert!(BlockTemplate::from_work(&bad).is_err());
    }

    #[test]
    fn test_publish_only_on_new_header() {
        let cache = TemplateCache::new();
        assert!(cache.current().is_none());

        assert!(cache.publish(BlockTemplate::from_work(&work('a')).unwrap()));
        let first = cache.current().unwrap();

        assert!(!cache.publish(BlockTemplate::from_work(&work('a')).unwrap()));
        assert!(Arc::ptr_eq(&first, &cache.current().unwrap()));

        assert!(cache.publish(BlockTemplate::from_work(&work('c')).unwrap()));
        assert_eq!(cache.current().unwrap().header, hash('c'));
    }

    #[test]
    fn test_work_reply_override() {
        let template = BlockTemplate::from_work(&work('a')).unwrap();
        let reply = template.work_reply(None);
        assert_eq!(reply[2], template.target);

        let reply = template.work_reply(Some("0xffff"));
        assert_eq!(reply[0], hash('a'));
        assert_eq!(reply[2], "0xffff");
    }
}
