use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Utc};
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::limits::MIN_YEAR;

/// Oldest date kept when history older than `retention_days` is dropped.
/// `None` when retention is off (0 days) or the cutoff falls before any
/// date the ledger can hold, so there is nothing to purge.
pub fn retention_cutoff(today: NaiveDate, retention_days: u64) -> Option<NaiveDate> {
    if retention_days == 0 {
        return None;
    }
    today
        .checked_sub_days(Days::new(retention_days))
        .filter(|cutoff| cutoff.year() >= MIN_YEAR)
}

/// Background task that hourly purges history past the retention window.
pub async fn run_retention(ledger: Arc<Ledger>, retention_days: u64) {
    if retention_days == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let Some(before) = retention_cutoff(Utc::now().date_naive(), retention_days) else {
            continue;
        };
        match ledger.purge_history(before).await {
            Ok(report) if !report.is_empty() => info!(
                "purged history before {before}: {} appointments, {} unproductive, {} overrides",
                report.appointments, report.unproductive, report.overrides
            ),
            Ok(_) => {}
            Err(e) => warn!("retention sweep failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if ledger.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = ledger.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
