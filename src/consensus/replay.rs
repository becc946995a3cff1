use crate::storage::{WalError, WalRecord};

/// Select the WAL suffix to replay for `height` (the next height to run).
///
/// The suffix starts right after `EndHeight(height - 1)`. A WAL whose latest
/// marker is already at or past `height` has nothing to replay; a WAL that
/// has markers but not the expected one cannot prove where the height starts
/// and refuses startup.
pub fn suffix_for_height(
    records: Vec<WalRecord>,
    height: u64,
) -> Result<Vec<WalRecord>, WalError> {
    let mut last_end: Option<(usize, u64)> = None;
    for (i, record) in records.iter().enumerate() {
        if let WalRecord::EndHeight(h) = record {
            last_end = Some((i, *h));
        }
    }

    match last_end {
        Some((i, h)) if h + 1 == height => Ok(records[i + 1..].to_vec()),
        Some((_, h)) if h >= height => Ok(Vec::new()),
        Some((_, h)) => {
            tracing::error!(
                wanted = height - 1,
                found = h,
                "WAL does not contain the end-of-height marker for the last committed height"
            );
            Err(WalError::DataCorruption)
        }
        None if height == 1 => Ok(records),
        None if records.is_empty() => Ok(Vec::new()),
        None => Err(WalError::DataCorruption),
    }
}
