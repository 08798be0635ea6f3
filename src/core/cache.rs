//! Row cache decorator.
//!
//! [`CachedTransform`] keeps an append-only copy of every row read through it.
//! Reads check the cache at the current position before pulling from the
//! inner transform, so a reset replays the same rows without re-querying the
//! source. Lookups follow the [`CachePolicy`].

use crate::core::transform::{check_cancel, Capabilities, Transform, TransformStats};
use crate::domain::model::Row;
use crate::domain::query::{evaluate_filters, Filter, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Forward only; lookups go straight to the inner transform.
    #[default]
    NoCache,
    /// Rows are cached as read; lookups check the cache, then the source.
    OnDemandCache,
    /// The whole input is cached before the first lookup.
    PreLoadCache,
}

pub struct CachedTransform {
    inner: Box<dyn Transform>,
    policy: CachePolicy,
    cache: Vec<Row>,
    position: usize,
    inner_done: bool,
    /// Upstream counters at the last reset.
    baseline: TransformStats,
    /// Rows cached before the last reset; reading them again is a replay.
    replay_end: usize,
    replayed: u64,
}

impl CachedTransform {
    pub fn new(inner: Box<dyn Transform>, policy: CachePolicy) -> Self {
        Self {
            inner,
            policy,
            cache: Vec::new(),
            position: 0,
            inner_done: false,
            baseline: TransformStats::default(),
            replay_end: 0,
            replayed: 0,
        }
    }

    fn clear_counters(&mut self, baseline: TransformStats) {
        self.baseline = baseline;
        self.replay_end = self.cache.len();
        self.replayed = 0;
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn cached_rows(&self) -> &[Row] {
        &self.cache
    }

    /// Pulls the rest of the inner transform into the cache. The read position
    /// is untouched, so later reads replay the loaded rows.
    pub async fn load_all(&mut self, cancel: &CancellationToken) -> Result<()> {
        while !self.inner_done {
            check_cancel(cancel, self.inner.name())?;
            match self.inner.read_record(cancel).await? {
                Some(row) => self.cache.push(row),
                None => self.inner_done = true,
            }
        }
        Ok(())
    }

    fn search_cache(&self, filters: &[Filter]) -> Result<Vec<Row>> {
        let schema = self.inner.schema();
        let mut matches = Vec::new();
        for row in &self.cache {
            if evaluate_filters(filters, schema, row)? {
                matches.push(row.clone());
            }
        }
        Ok(matches)
    }

    /// Every row matching `filters` under the cache policy.
    ///
    /// With `OnDemandCache` and no direct lookup on the inner transform this
    /// scans forward: rows passed over are cached but consumed, so the read
    /// position moves to just after the match.
    pub async fn lookup_rows(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Vec<Row>> {
        match self.policy {
            CachePolicy::PreLoadCache => {
                self.load_all(cancel).await?;
                self.search_cache(filters)
            }
            CachePolicy::OnDemandCache => {
                let cached = self.search_cache(filters)?;
                if !cached.is_empty() {
                    return Ok(cached);
                }
                if self.inner.capabilities().can_lookup_row_direct {
                    return self.inner.lookup_row_direct(filters, cancel).await;
                }
                while !self.inner_done {
                    check_cancel(cancel, self.inner.name())?;
                    match self.inner.read_record(cancel).await? {
                        Some(row) => {
                            let matched = evaluate_filters(filters, self.inner.schema(), &row)?;
                            self.cache.push(row.clone());
                            self.position = self.cache.len();
                            if matched {
                                return Ok(vec![row]);
                            }
                        }
                        None => self.inner_done = true,
                    }
                }
                Ok(Vec::new())
            }
            CachePolicy::NoCache => self.inner.lookup_row_direct(filters, cancel).await,
        }
    }
}

#[async_trait]
impl Transform for CachedTransform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_lookup_row_direct: self.policy != CachePolicy::NoCache
                || self.inner.capabilities().can_lookup_row_direct,
            ..self.inner.capabilities()
        }
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.inner.sort_fields()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.cache.clear();
        self.position = 0;
        self.inner_done = false;
        self.clear_counters(TransformStats::default());
        self.inner.open(audit_key, query, cancel).await
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        if let Some(row) = self.cache.get(self.position) {
            if self.position < self.replay_end {
                self.replayed += 1;
            }
            self.position += 1;
            return Ok(Some(row.clone()));
        }
        if self.inner_done {
            return Ok(None);
        }
        match self.inner.read_record(cancel).await? {
            Some(row) => {
                if self.policy != CachePolicy::NoCache {
                    self.cache.push(row.clone());
                    self.position = self.cache.len();
                }
                Ok(Some(row))
            }
            None => {
                self.inner_done = true;
                Ok(None)
            }
        }
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Vec<Row>> {
        self.lookup_rows(filters, cancel).await
    }

    async fn lookup_row(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Option<Row>> {
        Ok(self.lookup_rows(filters, cancel).await?.into_iter().next())
    }

    fn stats(&self) -> TransformStats {
        TransformStats::default()
    }

    /// Upstream counters since the last reset, with replayed rows counted as reads.
    fn total_stats(&self) -> TransformStats {
        let mut total = self.inner.total_stats().since(self.baseline);
        total.rows_read_primary += self.replayed;
        total
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.inner.as_ref())
    }

    /// Rewinds to the first cached row and clears the counters. Without a cache
    /// the inner transform is reset.
    fn reset(&mut self) -> Result<()> {
        self.position = 0;
        if self.policy == CachePolicy::NoCache {
            self.inner_done = false;
            self.inner.reset()?;
            self.clear_counters(TransformStats::default());
            return Ok(());
        }
        let baseline = self.inner.total_stats();
        self.clear_counters(baseline);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::memory::MemoryTransform;
    use crate::domain::model::{DataType, Value};
    use crate::domain::schema::Column;

    fn codes(ignore_lookup: bool) -> Box<dyn Transform> {
        let schema = Schema::new(
            "codes",
            vec![Column::new("code", DataType::String), Column::new("n", DataType::Int)],
        );
        let rows = vec![
            vec!["a".into(), 1.into()],
            vec!["b".into(), 2.into()],
            vec!["c".into(), 3.into()],
            vec!["d".into(), 4.into()],
        ];
        if ignore_lookup {
            Box::new(NoDirectLookup(MemoryTransform::new(schema, rows)))
        } else {
            Box::new(MemoryTransform::new(schema, rows))
        }
    }

    /// Memory source that hides its direct lookup, like a streaming file.
    struct NoDirectLookup(MemoryTransform);

    #[async_trait]
    impl Transform for NoDirectLookup {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn schema(&self) -> &Schema {
            self.0.schema()
        }
        async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
            self.0.open(audit_key, query, cancel).await
        }
        async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
            self.0.read_record(cancel).await
        }
        fn stats(&self) -> TransformStats {
            self.0.stats()
        }
        fn reset(&mut self) -> Result<()> {
            self.0.reset()
        }
    }

    async fn read_codes(t: &mut CachedTransform, n: usize) -> Vec<String> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        for _ in 0..n {
            match t.read_record(&cancel).await.unwrap() {
                Some(row) => out.push(row[0].to_string()),
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_reset_replays_cached_rows() {
        let cancel = CancellationToken::new();
        for policy in [CachePolicy::OnDemandCache, CachePolicy::PreLoadCache] {
            let mut t = CachedTransform::new(codes(true), policy);
            t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
            let first = read_codes(&mut t, 3).await;
            t.reset().unwrap();
            assert_eq!(t.total_stats(), TransformStats::default());
            assert_eq!(read_codes(&mut t, 3).await, first);
            assert_eq!(read_codes(&mut t, 10).await, vec!["d"]);
            assert_eq!(t.total_stats().rows_read_primary, 4);
        }
    }

    #[tokio::test]
    async fn test_preload_lookup_does_not_move_position() {
        let cancel = CancellationToken::new();
        let mut t = CachedTransform::new(codes(true), CachePolicy::PreLoadCache);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(read_codes(&mut t, 1).await, vec!["a"]);

        let found = t.lookup_row(&[Filter::equal("code", "c")], &cancel).await.unwrap();
        assert_eq!(found.unwrap()[1], Value::Int(3));
        assert_eq!(t.cached_rows().len(), 4);
        assert_eq!(read_codes(&mut t, 10).await, vec!["b", "c", "d"]);
        // Rows read after preloading are not counted twice.
        assert_eq!(t.total_stats().rows_read_primary, 4);
    }

    #[tokio::test]
    async fn test_on_demand_scan_consumes_rows() {
        let cancel = CancellationToken::new();
        let mut t = CachedTransform::new(codes(true), CachePolicy::OnDemandCache);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();

        let found = t.lookup_row(&[Filter::equal("code", "b")], &cancel).await.unwrap();
        assert!(found.is_some());
        // Cache hit, no further scanning.
        let again = t.lookup_row(&[Filter::equal("code", "a")], &cancel).await.unwrap();
        assert!(again.is_some());
        assert_eq!(read_codes(&mut t, 10).await, vec!["c", "d"]);

        let missing = t.lookup_row(&[Filter::equal("code", "z")], &cancel).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_on_demand_prefers_direct_lookup() {
        let cancel = CancellationToken::new();
        let mut t = CachedTransform::new(codes(false), CachePolicy::OnDemandCache);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        let found = t.lookup_row(&[Filter::equal("code", "d")], &cancel).await.unwrap();
        assert!(found.is_some());
        assert_eq!(read_codes(&mut t, 10).await, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_no_cache_requires_direct_lookup() {
        let cancel = CancellationToken::new();
        let mut t = CachedTransform::new(codes(true), CachePolicy::NoCache);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert!(t.lookup_row(&[Filter::equal("code", "a")], &cancel).await.is_err());

        let mut t = CachedTransform::new(codes(false), CachePolicy::NoCache);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert!(t
            .lookup_row(&[Filter::equal("code", "a")], &cancel)
            .await
            .unwrap()
            .is_some());
    }
}
