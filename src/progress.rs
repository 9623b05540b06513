//! Per-item progress and the per-course completion summary.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{CourseProgress, Progress, ProgressKey, ProgressStatus};
use crate::service::Service;

impl Service {
    /// Upserts the (user, course, item) row. Each call counts as one attempt,
    /// including the call that creates the row.
    pub async fn record_progress(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        item_id: Uuid,
        status: &str,
        score: f64,
    ) -> AppResult<Progress> {
        let status = status.trim();
        if status.is_empty() {
            return Err(AppError::invalid("status is required"));
        }
        let status: ProgressStatus = status
            .parse()
            .map_err(|_| AppError::invalid("invalid status"))?;
        if !score.is_finite() {
            return Err(AppError::invalid("invalid score"));
        }

        let now = Utc::now();
        let key = ProgressKey { user_id, course_id, item_id };
        let row = self
            .timed(self.store().upsert_progress(key, status, score, now))
            .await?;
        tracing::debug!(
            user_id = %user_id,
            course_id = %course_id,
            item_id = %item_id,
            status = %status,
            attempts = row.attempts,
            "progress recorded"
        );

        // lastAccessAt is advisory; the progress write already succeeded
        match self.timed(self.store().touch_enrollment(user_id, course_id, now)).await {
            Ok(outcome) if outcome.matched == 0 => {
                tracing::debug!(user_id = %user_id, course_id = %course_id, "progress without enrollment")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, course_id = %course_id, "failed to touch enrollment"),
        }
        Ok(row)
    }

    /// Completion summary for every course the user is enrolled in. Pure read.
    pub async fn my_progress(&self, user_id: Uuid) -> AppResult<Vec<CourseProgress>> {
        self.timed(self.store().course_progress(user_id)).await
    }
}
