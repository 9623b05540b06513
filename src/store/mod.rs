//! Entity store: the three collections (courses, enrollments, progress) and
//! the atomic single-document operations the services build on.
//!
//! Every mutation is one round trip scoped to one document. Nested module and
//! item updates are expressed as a [`CourseMutation`] and applied by the store
//! in place, never by reading the course, editing it and writing it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Course, CoursePatch, CourseProgress, Enrollment, Item, ItemPatch, Module, ModulePatch,
    Progress, ProgressKey, ProgressStatus,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write; carries the entity name.
    #[error("duplicate key on {0}")]
    DuplicateKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counts reported by an update. `matched` is the number of parent documents
/// found, `modified` the number whose targeted element was found and changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

/// Field-level mutation applied atomically to one course document.
#[derive(Debug, Clone, PartialEq)]
pub enum CourseMutation {
    SetFields(CoursePatch),
    PushModule(Module),
    SetModule { module_id: Uuid, patch: ModulePatch },
    PullModule { module_id: Uuid },
    PushItem { module_id: Uuid, item: Item },
    SetItem { module_id: Uuid, item_id: Uuid, patch: ItemPatch },
    PullItem { module_id: Uuid, item_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CourseFilter {
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
    pub category: Option<String>,
    pub teacher_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CourseSort {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
    TitleAsc,
    TitleDesc,
}

impl CourseSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "createdAt_desc" => Some(CourseSort::CreatedAtDesc),
            "createdAt_asc" => Some(CourseSort::CreatedAtAsc),
            "title_asc" => Some(CourseSort::TitleAsc),
            "title_desc" => Some(CourseSort::TitleDesc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CourseQuery {
    pub filter: CourseFilter,
    pub sort: CourseSort,
    pub skip: u64,
    pub limit: u64,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    // courses
    async fn insert_course(&self, course: &Course) -> StoreResult<Course>;
    async fn find_course(&self, id: Uuid) -> StoreResult<Option<Course>>;
    async fn find_courses(&self, query: &CourseQuery) -> StoreResult<Vec<Course>>;
    async fn count_courses(&self, filter: &CourseFilter) -> StoreResult<u64>;
    /// Applies `mutation` to course `id` and refreshes its `updatedAt` to `at`.
    /// Nothing is written when the targeted element is missing.
    async fn update_course(
        &self,
        id: Uuid,
        mutation: &CourseMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome>;
    async fn delete_course(&self, id: Uuid) -> StoreResult<u64>;

    // enrollments
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<Enrollment>;
    async fn find_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>>;
    /// Deletes the enrollment only when it belongs to `user_id`.
    async fn delete_enrollment(&self, id: Uuid, user_id: Uuid) -> StoreResult<u64>;
    async fn delete_enrollments_by_course(&self, course_id: Uuid) -> StoreResult<u64>;
    async fn touch_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome>;

    // progress
    /// Upserts the row for `key`, setting status, score and `updatedAt` and
    /// incrementing `attempts` by one (a fresh row starts at one).
    async fn upsert_progress(
        &self,
        key: ProgressKey,
        status: ProgressStatus,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<Progress>;
    /// Joins the user's enrollments with their courses and progress rows.
    /// Rows are ordered by completion rate descending, then title ascending.
    async fn course_progress(&self, user_id: Uuid) -> StoreResult<Vec<CourseProgress>>;
}
