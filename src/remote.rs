//! Foreground-side mirror of a daemon downloader.
//!
//! The frontend holds one [`RemoteDownloader`] per item. Status updates
//! arrive over the RPC channel with the bulky fields (`metainfo`,
//! `fastResumeData`) delta-encoded, so the mirror merges updates instead
//! of replacing its record. The module also decides what happens to each
//! persisted record when the daemon starts up.

use crate::protocol::{DownloadState, TransferStatus};

/// What the daemon should do with a restored status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAction {
    /// Restart the transfer, resuming from the partial data.
    Resume,
    /// Re-enter the seeding phase.
    RestoreSeeding,
    /// The seeding ratio was already reached; finish immediately.
    StopUpload,
    /// Keep the record as-is without starting anything.
    Keep,
}

/// Startup policy for a persisted record.
///
/// Items that were actively transferring come back up; a seeding item
/// only resumes when the user asked for manual upload or the ratio cap
/// has not been reached yet. Everything else (paused, stopped, failed,
/// finished) is restored as a passive record.
pub fn restore_action(status: &TransferStatus, ratio_reached: bool) -> RestoreAction {
    match status.state {
        DownloadState::Downloading | DownloadState::Offline => RestoreAction::Resume,
        DownloadState::Uploading => {
            if status.manual_upload || !ratio_reached {
                RestoreAction::RestoreSeeding
            } else {
                RestoreAction::StopUpload
            }
        }
        DownloadState::Paused
        | DownloadState::UploadingPaused
        | DownloadState::Stopped
        | DownloadState::Failed
        | DownloadState::Finished => RestoreAction::Keep,
    }
}

/// Client-side downloader record.
#[derive(Debug, Clone)]
pub struct RemoteDownloader {
    status: TransferStatus,
}

impl RemoteDownloader {
    pub fn new(status: TransferStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    /// Merges an update from the daemon. Absent delta fields keep their
    /// previous values; rate counters are taken verbatim.
    pub fn apply_update(&mut self, update: TransferStatus) {
        let metainfo = update
            .metainfo
            .clone()
            .or_else(|| self.status.metainfo.take());
        let fast_resume = update
            .fast_resume_data
            .clone()
            .or_else(|| self.status.fast_resume_data.take());
        self.status = update;
        self.status.metainfo = metainfo;
        self.status.fast_resume_data = fast_resume;
    }

    /// Completed fraction in `0.0..=1.0`, or `None` when the total size
    /// is still unknown.
    pub fn progress(&self) -> Option<f64> {
        if self.status.total_size <= 0 {
            return None;
        }
        Some((self.status.current_size as f64 / self.status.total_size as f64).min(1.0))
    }

    /// Seconds until completion at the current rate.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.status.rate == 0 || self.status.total_size <= 0 {
            return None;
        }
        let remaining = (self.status.total_size as u64).saturating_sub(self.status.current_size);
        Some(remaining / self.status.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DownloadKind, DownloaderId};

    fn status(state: DownloadState, manual: bool) -> TransferStatus {
        let mut s = TransferStatus::new(
            DownloaderId::from_string("testtest"),
            "http://example.com/ep.torrent",
            DownloadKind::Bittorrent,
        );
        s.state = state;
        s.manual_upload = manual;
        s
    }

    #[test]
    fn active_states_resume() {
        assert_eq!(
            restore_action(&status(DownloadState::Downloading, false), false),
            RestoreAction::Resume
        );
        assert_eq!(
            restore_action(&status(DownloadState::Offline, false), false),
            RestoreAction::Resume
        );
    }

    #[test]
    fn seeding_respects_ratio_and_manual_flag() {
        assert_eq!(
            restore_action(&status(DownloadState::Uploading, false), false),
            RestoreAction::RestoreSeeding
        );
        assert_eq!(
            restore_action(&status(DownloadState::Uploading, false), true),
            RestoreAction::StopUpload
        );
        // manual upload wins over the ratio cap
        assert_eq!(
            restore_action(&status(DownloadState::Uploading, true), true),
            RestoreAction::RestoreSeeding
        );
    }

    #[test]
    fn terminal_states_stay_put() {
        for state in [
            DownloadState::Paused,
            DownloadState::UploadingPaused,
            DownloadState::Stopped,
            DownloadState::Failed,
            DownloadState::Finished,
        ] {
            assert_eq!(
                restore_action(&status(state, false), false),
                RestoreAction::Keep
            );
        }
    }

    #[test]
    fn delta_fields_survive_updates() {
        let mut record = RemoteDownloader::new(status(DownloadState::Downloading, false));
        let mut with_blob = record.status().clone();
        with_blob.metainfo = Some(vec![1, 2, 3]);
        with_blob.fast_resume_data = Some(vec![4, 5]);
        record.apply_update(with_blob);

        let mut delta = record.status().without_deltas();
        delta.current_size = 999;
        record.apply_update(delta);

        assert_eq!(record.status().current_size, 999);
        assert_eq!(record.status().metainfo.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(record.status().fast_resume_data.as_deref(), Some(&[4u8, 5][..]));
    }
}
