//! Enrollment ledger: who is enrolled in which course.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Enrollment, ENROLLMENT_ACTIVE};
use crate::service::Service;

impl Service {
    /// Enrolls `user_id` in `course_id`. The course check and the insert are
    /// two store calls; a course removed in between leaves an orphaned row.
    pub async fn enroll(&self, user_id: Uuid, course_id: Uuid) -> AppResult<Enrollment> {
        self.timed(self.store().find_course(course_id))
            .await?
            .ok_or_else(|| AppError::not_found("course not found"))?;

        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            status: ENROLLMENT_ACTIVE.to_string(),
            enrolled_at: Utc::now(),
            last_access_at: None,
        };
        let enrollment = self.timed(self.store().insert_enrollment(&enrollment)).await?;
        tracing::info!(user_id = %user_id, course_id = %course_id, "enrolled");
        Ok(enrollment)
    }

    pub async fn list_my_enrollments(&self, user_id: Uuid) -> AppResult<Vec<Enrollment>> {
        self.timed(self.store().find_enrollments(user_id)).await
    }

    /// Missing and foreign enrollments both answer `NotFound`.
    pub async fn delete_enrollment(&self, user_id: Uuid, enrollment_id: Uuid) -> AppResult<()> {
        let deleted = self
            .timed(self.store().delete_enrollment(enrollment_id, user_id))
            .await?;
        if deleted == 0 {
            return Err(AppError::not_found("enrollment not found"));
        }
        tracing::info!(user_id = %user_id, enrollment_id = %enrollment_id, "enrollment deleted");
        Ok(())
    }

    /// Removes every enrollment of a course. Only the course's teacher may
    /// do this; returns the number of rows removed.
    pub async fn delete_enrollments_by_course(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> AppResult<u64> {
        let course = self
            .timed(self.store().find_course(course_id))
            .await?
            .ok_or_else(|| AppError::not_found("course not found"))?;
        if course.teacher_id != user_id {
            tracing::warn!(user_id = %user_id, course_id = %course_id, "bulk unenroll by non-owner");
            return Err(AppError::Forbidden);
        }

        let deleted = self
            .timed(self.store().delete_enrollments_by_course(course_id))
            .await?;
        tracing::info!(course_id = %course_id, deleted, "course enrollments deleted");
        Ok(deleted)
    }
}
