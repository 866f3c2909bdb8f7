use indexmap::IndexSet;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::config::FofaConfig;
use crate::decoder::{decode_page, Page};
use crate::types::{BucketKey, Service, ServiceEntry};

/// What happened to one candidate during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New distinct entity, appended with a freshly minted sequence number.
    Appended,
    /// Took the slot (and sequence number) of an existing duplicate.
    Replaced,
    /// Existing entry was preferred; the candidate was dropped.
    Discarded,
}

/// Per-page merge counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub rows: usize,
    pub appended: usize,
    pub replaced: usize,
    pub discarded: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Appended => self.appended += 1,
            MergeOutcome::Replaced => self.replaced += 1,
            MergeOutcome::Discarded => self.discarded += 1,
        }
    }
}

enum Resolution {
    KeepExisting,
    Replace,
    Distinct,
}

/// Running, deduplicated result set of one query session.
///
/// Entries keep their position for the lifetime of the state: a replacement
/// overwrites the slot of the entry it supersedes, so bucket indices never
/// go stale and display order stays stable.
#[derive(Debug, Clone)]
pub struct AggregationState<T> {
    count: u64,
    entries: Vec<T>,
    buckets: HashMap<BucketKey, Vec<usize>>,
    urls: IndexSet<String>,
    fetched_rows: u64,
    /// Total result count reported by the server.
    pub total: u64,
    /// Cursor for the next page request.
    pub next: Option<String>,
    pub has_more_data: bool,
    /// 1-based index of the next page to request.
    pub page: u32,
}

impl<T: ServiceEntry> Default for AggregationState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ServiceEntry> AggregationState<T> {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
            buckets: HashMap::new(),
            urls: IndexSet::new(),
            fetched_rows: 0,
            total: 0,
            next: None,
            has_more_data: true,
            page: 1,
        }
    }

    pub fn records(&self) -> &[T] {
        &self.entries
    }

    pub fn into_records(self) -> Vec<T> {
        self.entries
    }

    /// Links seen so far, in first-seen order.
    pub fn urls(&self) -> &IndexSet<String> {
        &self.urls
    }

    /// Last minted sequence number. Always 0 for export-mode states; use
    /// [`len`](Self::len) for the number of distinct entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `page`, merge its rows and update pagination.
    ///
    /// A page without results changes nothing but the page index.
    pub fn apply_page(&mut self, page: &Page, config: &FofaConfig) -> MergeStats {
        let current = self.page;
        self.page += 1;
        if page.results.is_empty() {
            debug!(page = current, "empty page");
            return MergeStats::default();
        }

        let candidates: Vec<T> = decode_page(page, &config.additional_fields);
        let mut stats = self.merge_all(candidates);
        stats.rows = page.results.len();

        self.fetched_rows += page.results.len() as u64;
        self.total = page.size;
        match &page.next {
            Some(cursor) if !cursor.is_empty() => self.next = Some(cursor.clone()),
            _ => self.has_more_data = false,
        }
        if self.total < config.page_size
            || self.fetched_rows >= self.total
            || self.entries.len() as u64 >= config.max_records
        {
            self.has_more_data = false;
        }

        debug!(
            page = current,
            rows = stats.rows,
            appended = stats.appended,
            replaced = stats.replaced,
            discarded = stats.discarded,
            total = self.total,
            more = self.has_more_data,
            "merged page"
        );
        stats
    }

    pub fn merge_all(&mut self, candidates: impl IntoIterator<Item = T>) -> MergeStats {
        let mut stats = MergeStats::default();
        for c in candidates {
            stats.record(self.merge(c));
        }
        stats
    }

    /// Merge one candidate against the running set.
    pub fn merge(&mut self, mut candidate: T) -> MergeOutcome {
        let key = candidate.service().bucket_key();
        let matched = self.buckets.get(&key).and_then(|slots| {
            slots
                .iter()
                .copied()
                .find(|&i| self.entries[i].service().same_entity(candidate.service()))
        });

        let Some(slot) = matched else {
            return self.append(candidate, key);
        };

        match resolve(self.entries[slot].service(), candidate.service()) {
            Resolution::KeepExisting => MergeOutcome::Discarded,
            Resolution::Replace => {
                if let Some(seq) = self.entries[slot].sequence() {
                    candidate.set_sequence(seq);
                }
                self.remember_url(candidate.service());
                self.entries[slot] = candidate;
                MergeOutcome::Replaced
            }
            Resolution::Distinct => self.append(candidate, key),
        }
    }

    fn append(&mut self, mut candidate: T, key: BucketKey) -> MergeOutcome {
        // Only render-mode entries carry a number.
        if candidate.sequence().is_some() {
            self.count += 1;
            candidate.set_sequence(self.count);
        }
        self.remember_url(candidate.service());
        self.buckets.entry(key).or_default().push(self.entries.len());
        self.entries.push(candidate);
        MergeOutcome::Appended
    }

    fn remember_url(&mut self, service: &Service) {
        if !service.link.is_empty() {
            self.urls.insert(service.link.clone());
        }
    }
}

// On 80/443 the host without an explicit port wins; otherwise, for the same
// host, the entry with a title wins.
fn resolve(existing: &Service, candidate: &Service) -> Resolution {
    let same_host = existing.host == candidate.host;
    if matches!(candidate.port, 80 | 443) && !same_host {
        if existing.has_default_port_suffix() {
            return Resolution::Replace;
        }
        if candidate.has_default_port_suffix() {
            return Resolution::KeepExisting;
        }
    }
    if same_host {
        return if existing.title.is_empty() {
            Resolution::Replace
        } else {
            Resolution::KeepExisting
        };
    }
    Resolution::Distinct
}
