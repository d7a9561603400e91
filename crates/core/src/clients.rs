use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::Codec;
use crate::distribution::TapId;

/// Negotiated state of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub codec: Codec,
    /// Tap of the client's live branch, once linked.
    pub branch: Option<TapId>,
}

/// Codec negotiated per client id.
///
/// Last write wins on renegotiation. Used for lookups only; branch
/// ordering is enforced elsewhere.
#[derive(Clone, Default)]
pub struct ClientCodecTable {
    records: Arc<RwLock<HashMap<String, ClientRecord>>>,
}

impl ClientCodecTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `codec` for `client_id`. Clears any branch reference.
    pub fn set(&self, client_id: &str, codec: Codec) {
        let previous = self.records.write().insert(
            client_id.to_string(),
            ClientRecord {
                client_id: client_id.to_string(),
                codec,
                branch: None,
            },
        );
        match previous {
            Some(old) if old.codec != codec => {
                tracing::debug!(client_id, from = %old.codec, to = %codec, "client codec renegotiated")
            }
            Some(_) => {}
            None => tracing::debug!(client_id, %codec, "client codec recorded"),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Codec> {
        self.records.read().get(client_id).map(|r| r.codec)
    }

    pub fn record(&self, client_id: &str) -> Option<ClientRecord> {
        self.records.read().get(client_id).cloned()
    }

    /// Attach the live branch to an existing record. Returns `false` if
    /// the client has no record.
    pub fn attach_branch(&self, client_id: &str, tap: TapId) -> bool {
        match self.records.write().get_mut(client_id) {
            Some(record) => {
                record.branch = Some(tap);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, client_id: &str) -> Option<ClientRecord> {
        let removed = self.records.write().remove(client_id);
        if removed.is_some() {
            tracing::debug!(client_id, "client record removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributionStage;
    use crate::media::{PixelLayout, VideoFormat};

    #[test]
    fn last_write_wins() {
        let table = ClientCodecTable::new();
        table.set("a", Codec::Vp8);
        table.set("a", Codec::H264);
        assert_eq!(table.get("a"), Some(Codec::H264));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_and_missing() {
        let table = ClientCodecTable::new();
        assert_eq!(table.get("ghost"), None);
        assert!(table.remove("ghost").is_none());

        table.set("a", Codec::Vp9);
        let record = table.remove("a").unwrap();
        assert_eq!(record.codec, Codec::Vp9);
        assert!(table.is_empty());
    }

    #[test]
    fn attach_branch_requires_record() {
        let table = ClientCodecTable::new();
        let stage =
            DistributionStage::new(VideoFormat::new(PixelLayout::I420, 2, 2, (30, 1))).unwrap();
        let tap = stage.acquire_tap().unwrap();

        assert!(!table.attach_branch("a", tap));
        table.set("a", Codec::Av1);
        assert!(table.attach_branch("a", tap));
        assert_eq!(table.record("a").unwrap().branch, Some(tap));

        // Renegotiation resets the branch reference.
        table.set("a", Codec::Av1);
        assert_eq!(table.record("a").unwrap().branch, None);
    }

    #[test]
    fn shared_between_clones() {
        let table = ClientCodecTable::new();
        let other = table.clone();
        table.set("b", Codec::Vp8);
        table.set("a", Codec::Vp8);
        assert_eq!(other.client_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
