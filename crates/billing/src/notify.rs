//! Trial lifecycle notifications.
//!
//! The warning sweep only needs "tell the tenant their trial is ending";
//! delivery is behind a trait so the worker can run with plain log output
//! while a real mail/push integration slots in later.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
pub struct TrialEndingNotice {
    pub user_id: Uuid,
    pub trial_end_date: OffsetDateTime,
    pub days_left: i64,
}

#[async_trait]
pub trait TrialNotifier: Send + Sync {
    async fn trial_ending(&self, notice: &TrialEndingNotice) -> BillingResult<()>;
}

/// Default notifier: writes the notice to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl TrialNotifier for LogNotifier {
    async fn trial_ending(&self, notice: &TrialEndingNotice) -> BillingResult<()> {
        tracing::info!(
            user_id = %notice.user_id,
            trial_end_date = %notice.trial_end_date,
            days_left = notice.days_left,
            "Trial ending soon"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every notice; can be told to fail to exercise sweep error
    /// isolation.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub sent: Arc<Mutex<Vec<TrialEndingNotice>>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl RecordingNotifier {
        pub fn sent_count(&self) -> usize {
            self.sent.lock().map(|s| s.len()).unwrap_or(0)
        }

        pub fn set_fail(&self, fail: bool) {
            if let Ok(mut f) = self.fail.lock() {
                *f = fail;
            }
        }
    }

    #[async_trait]
    impl TrialNotifier for RecordingNotifier {
        async fn trial_ending(&self, notice: &TrialEndingNotice) -> BillingResult<()> {
            if self.fail.lock().map(|f| *f).unwrap_or(false) {
                return Err(BillingError::Notifier("simulated delivery failure".into()));
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(notice.clone());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    fn notice(days_left: i64) -> TrialEndingNotice {
        TrialEndingNotice {
            user_id: Uuid::new_v4(),
            trial_end_date: OffsetDateTime::now_utc() + time::Duration::days(days_left),
            days_left,
        }
    }

    #[tokio::test]
    async fn recording_notifier_captures_notices() {
        let notifier = RecordingNotifier::default();
        notifier.trial_ending(&notice(3)).await.unwrap();
        notifier.trial_ending(&notice(1)).await.unwrap();

        assert_eq!(notifier.sent_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_notifier_error() {
        let notifier = RecordingNotifier::default();
        notifier.set_fail(true);

        let err = notifier.trial_ending(&notice(2)).await.unwrap_err();
        assert!(matches!(err, BillingError::Notifier(_)));
        assert_eq!(notifier.sent_count(), 0);
    }
}
