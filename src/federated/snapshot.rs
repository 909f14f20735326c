//! Per-collection sync metadata and the listing diff.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Bumped whenever the persisted shape changes; older snapshots load as absent.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One entry of the remote item listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
  pub hash: String,
  pub first_change: Option<DateTime<Utc>>,
  pub second_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
  pub hash: String,
  #[serde(rename = "firstChangeTs")]
  pub first_change: Option<DateTime<Utc>>,
  #[serde(rename = "secondChangeTs")]
  pub second_change: Option<DateTime<Utc>>,
  pub cached_at: DateTime<Utc>,
}

impl ItemMetadata {
  pub fn from_listing(item: &ListedItem, cached_at: DateTime<Utc>) -> Self {
    Self {
      hash: item.hash.clone(),
      first_change: item.first_change,
      second_change: item.second_change,
      cached_at,
    }
  }

  /// Either timestamp of `item` is strictly newer than the recorded one.
  pub fn is_outdated_by(&self, item: &ListedItem) -> bool {
    newer(item.first_change, self.first_change) || newer(item.second_change, self.second_change)
  }
}

fn newer(fresh: Option<DateTime<Utc>>, known: Option<DateTime<Utc>>) -> bool {
  match (fresh, known) {
    (Some(fresh), Some(known)) => fresh > known,
    (Some(_), None) => true,
    _ => false,
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
  pub version: u32,
  #[serde(rename = "lastFetchTimestamp")]
  pub last_fetch: DateTime<Utc>,
  #[serde(rename = "expirationTimestamp")]
  pub expires_at: DateTime<Utc>,
  pub items: BTreeMap<String, ItemMetadata>,
}

impl SyncSnapshot {
  /// A snapshot of exactly `listing`, captured now.
  pub fn from_listing(listing: &[ListedItem], ttl: Duration) -> Self {
    let now = Utc::now();
    Self {
      version: SNAPSHOT_VERSION,
      last_fetch: now,
      expires_at: now + ttl,
      items: listing
        .iter()
        .map(|item| (item.hash.clone(), ItemMetadata::from_listing(item, now)))
        .collect(),
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }

  /// Partition a fresh listing against this snapshot. A hash listed more
  /// than once is classified by its first occurrence.
  pub fn diff(&self, listing: &[ListedItem]) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();
    let mut listed = HashSet::with_capacity(listing.len());
    for item in listing {
      if !listed.insert(item.hash.as_str()) {
        continue;
      }
      match self.items.get(&item.hash) {
        None => diff.new.push(item.clone()),
        Some(known) if known.is_outdated_by(item) => diff.updated.push(item.clone()),
        Some(_) => diff.unchanged.push(item.hash.clone()),
      }
    }
    diff.deleted = self
      .items
      .keys()
      .filter(|hash| !listed.contains(hash.as_str()))
      .cloned()
      .collect();
    diff
  }

  /// The snapshot after a delta sync: exactly the listed hashes, keeping the
  /// capture time of unchanged items.
  pub fn advanced(&self, listing: &[ListedItem]) -> Self {
    let now = Utc::now();
    let mut items = BTreeMap::new();
    for item in listing {
      items.entry(item.hash.clone()).or_insert_with(|| match self.items.get(&item.hash) {
        Some(known) if !known.is_outdated_by(item) => known.clone(),
        _ => ItemMetadata::from_listing(item, now),
      });
    }
    Self {
      version: SNAPSHOT_VERSION,
      last_fetch: now,
      expires_at: self.expires_at,
      items,
    }
  }
}

/// The listing with repeated hashes dropped, first occurrence kept.
pub fn dedup_listing(mut listing: Vec<ListedItem>) -> Vec<ListedItem> {
  let mut seen = HashSet::with_capacity(listing.len());
  listing.retain(|item| seen.insert(item.hash.clone()));
  listing
}

/// Listing partition computed by [`SyncSnapshot::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
  pub new: Vec<ListedItem>,
  pub updated: Vec<ListedItem>,
  pub unchanged: Vec<String>,
  pub deleted: Vec<String>,
}

impl SnapshotDiff {
  /// Items whose body has to be fetched.
  pub fn to_fetch(&self) -> impl Iterator<Item = &ListedItem> {
    self.new.iter().chain(self.updated.iter())
  }
}
