//! Batch loops, one per [`FetchStrategy`](sos_source::FetchStrategy). Both
//! write every batch to the scratch collection and return the number of
//! records written.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use sos_source::{BatchRequest, IdBounds, NextCursor, ProviderSource, RateLimiter, TimeWindow};
use sos_store::CollectionStore;
use tokio_util::sync::CancellationToken;

use crate::HarvestError;
use crate::gate::AdmissionGate;
use crate::progress::ProgressCallback;

/// Everything a driver writes to and reports through.
pub struct DriverContext<'a> {
    /// Destination store.
    pub store: &'a dyn CollectionStore,
    /// Scratch collection receiving the batches.
    pub scratch: &'a str,
    /// Checked before every batch.
    pub cancel: &'a CancellationToken,
    /// Advanced by each batch's record count.
    pub progress: &'a dyn ProgressCallback,
}

impl DriverContext<'_> {
    pub(crate) fn check_cancel(&self) -> Result<(), HarvestError> {
        if self.cancel.is_cancelled() {
            Err(HarvestError::Canceled)
        } else {
            Ok(())
        }
    }

    async fn store_batch(&self, records: Vec<serde_json::Value>) -> Result<u64, HarvestError> {
        let count = records.len() as u64;
        if count > 0 {
            self.store.write_batch(self.scratch, records).await?;
            self.progress.inc(count);
        }
        Ok(count)
    }
}

/// Pages through consecutive time windows from `start` up to `now`.
///
/// Within a window the cursor returned by each batch is passed back until
/// the source reports [`NextCursor::CaughtUp`]; then the window advances
/// and the cursor resets. Request starts are spaced by `limiter`.
///
/// # Errors
///
/// Returns [`HarvestError::Canceled`] if `ctx.cancel` fires, or the first
/// source or store error.
pub async fn run_cursor(
    source: &dyn ProviderSource,
    ctx: &DriverContext<'_>,
    start: DateTime<Utc>,
    window_length: chrono::Duration,
    now: DateTime<Utc>,
    limiter: &RateLimiter,
) -> Result<u64, HarvestError> {
    if window_length <= chrono::Duration::zero() {
        return Err(HarvestError::Contract {
            message: format!("{}: window length must be positive", source.id()),
        });
    }

    let mut window = TimeWindow {
        from: start,
        to: (start + window_length).min(now),
    };
    let mut cursor: Option<String> = None;
    let mut total = 0u64;
    let mut batch_index = 0u64;

    while !window.is_empty() {
        ctx.check_cancel()?;
        limiter.acquire().await;

        let request = BatchRequest::Cursor {
            cursor: cursor.clone(),
            window,
        };
        let batch = source.fetch_batch(&request).await.map_err(|e| {
            log::error!("[{}] Batch {batch_index} failed: {e}", source.id());
            e
        })?;

        let count = ctx.store_batch(batch.records).await?;
        total += count;
        log::debug!(
            "[{}] Batch {batch_index}: {count} records ({} .. {}, total: {total})",
            source.id(),
            window.from,
            window.to
        );

        match batch.next {
            NextCursor::Continue(next) => cursor = Some(next),
            NextCursor::CaughtUp => {
                cursor = None;
                window = window.advance(window_length, now);
            }
        }
        batch_index += 1;
    }

    Ok(total)
}

/// Splits inclusive `bounds` into half-open chunks of at most `chunk_size`
/// ids.
///
/// # Errors
///
/// Returns [`HarvestError::Contract`] if `chunk_size` is zero or does not
/// fit an id, or if `bounds.max` is `i64::MAX` (its exclusive end would
/// overflow).
pub fn partition(bounds: IdBounds, chunk_size: u64) -> Result<Vec<(i64, i64)>, HarvestError> {
    let chunk = i64::try_from(chunk_size)
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| HarvestError::Contract {
            message: format!("invalid chunk size {chunk_size}"),
        })?;

    let end = bounds.max.checked_add(1).ok_or_else(|| HarvestError::Contract {
        message: format!("upper id bound {} leaves no room for an exclusive end", bounds.max),
    })?;
    let mut chunks = Vec::new();
    let mut from = bounds.min;
    while from < end {
        let to = from.saturating_add(chunk).min(end);
        chunks.push((from, to));
        from = to;
    }
    Ok(chunks)
}

/// Fetches every id chunk concurrently through `gate` and sums the
/// per-chunk counts. The first failing chunk aborts the others.
///
/// # Errors
///
/// Returns [`HarvestError::Canceled`] if `ctx.cancel` fires, or the first
/// source or store error.
pub async fn run_ranges(
    source: &dyn ProviderSource,
    ctx: &DriverContext<'_>,
    chunk_size: u64,
    gate: &AdmissionGate,
) -> Result<u64, HarvestError> {
    ctx.check_cancel()?;

    let Some(bounds) = source.id_bounds().await? else {
        log::info!("[{}] Provider reports no records", source.id());
        return Ok(0);
    };

    let chunks = partition(bounds, chunk_size)?;
    log::info!(
        "[{}] Fetching ids {}..={} in {} chunks ({} at a time)",
        source.id(),
        bounds.min,
        bounds.max,
        chunks.len(),
        gate.capacity()
    );
    ctx.progress
        .set_total(bounds.max.abs_diff(bounds.min).saturating_add(1));

    let counts = try_join_all(chunks.into_iter().enumerate().map(|(index, (from, to))| async move {
        let _pass = gate.enter().await?;
        ctx.check_cancel()?;

        let batch = source
            .fetch_batch(&BatchRequest::Range { from, to })
            .await
            .map_err(|e| {
                log::error!("[{}] Chunk {index} ({from}..{to}) failed: {e}", source.id());
                e
            })?;
        ctx.store_batch(batch.records).await
    }))
    .await?;

    Ok(counts.iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_bounds_exactly() {
        let chunks = partition(IdBounds { min: 1, max: 10 }, 4).unwrap();
        assert_eq!(chunks, vec![(1, 5), (5, 9), (9, 11)]);

        let single = partition(IdBounds { min: 7, max: 7 }, 100).unwrap();
        assert_eq!(single, vec![(7, 8)]);

        assert!(partition(IdBounds { min: 1, max: 2 }, 0).is_err());
    }

    #[test]
    fn partition_handles_extreme_bounds() {
        assert!(partition(IdBounds { min: i64::MAX - 2, max: i64::MAX }, 10).is_err());

        let wide = partition(IdBounds { min: i64::MIN, max: i64::MAX - 1 }, u64::MAX >> 1).unwrap();
        assert_eq!(wide.first().map(|c| c.0), Some(i64::MIN));
        assert_eq!(wide.last().map(|c| c.1), Some(i64::MAX));
        assert!(wide.windows(2).all(|w| w[0].1 == w[1].0));
    }
}
