//! In-process store used by the test suites.
//!
//! Documents live in arenas (`Vec`s) behind one lock; each operation takes the
//! write lock once, finds the element indices and edits them in place, which
//! keeps every call atomic with respect to the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    CourseFilter, CourseMutation, CourseQuery, CourseSort, EntityStore, StoreError, StoreResult,
    UpdateOutcome,
};
use crate::models::{Course, CourseProgress, Enrollment, Progress, ProgressKey, ProgressStatus};

#[derive(Default)]
struct Collections {
    courses: Vec<Course>,
    enrollments: Vec<Enrollment>,
    progress: Vec<Progress>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the progress collection.
    pub fn progress_rows(&self) -> Vec<Progress> {
        self.inner.read().progress.clone()
    }
}

fn matches(filter: &CourseFilter, course: &Course) -> bool {
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let in_title = course.title.to_lowercase().contains(&needle);
        let in_desc = course
            .description
            .as_deref()
            .map(|d| d.to_lowercase().contains(&needle))
            .unwrap_or(false);
        if !in_title && !in_desc {
            return false;
        }
    }
    if let Some(category) = &filter.category {
        if &course.category != category {
            return false;
        }
    }
    if let Some(teacher_id) = filter.teacher_id {
        if course.teacher_id != teacher_id {
            return false;
        }
    }
    true
}

fn items_count(course: &Course) -> i64 {
    course.modules.iter().map(|m| m.items.len() as i64).sum()
}

fn completion_rate(done_count: i64, items_count: i64) -> f64 {
    if items_count > 0 {
        done_count as f64 / items_count as f64
    } else {
        0.0
    }
}

fn module_index(course: &Course, module_id: Uuid) -> Option<usize> {
    course.modules.iter().position(|m| m.id == module_id)
}

/// Applies `mutation` to the document in place. Returns whether the targeted
/// element existed; the document is untouched when it did not.
fn apply(course: &mut Course, mutation: &CourseMutation) -> bool {
    match mutation {
        CourseMutation::SetFields(patch) => {
            if let Some(title) = &patch.title {
                course.title = title.clone();
            }
            if let Some(description) = &patch.description {
                course.description = description.clone();
            }
            if let Some(category) = &patch.category {
                course.category = category.clone();
            }
            true
        }
        CourseMutation::PushModule(module) => {
            course.modules.push(module.clone());
            true
        }
        CourseMutation::SetModule { module_id, patch } => match module_index(course, *module_id) {
            Some(mi) => {
                patch.apply(&mut course.modules[mi]);
                true
            }
            None => false,
        },
        CourseMutation::PullModule { module_id } => match module_index(course, *module_id) {
            Some(mi) => {
                course.modules.remove(mi);
                true
            }
            None => false,
        },
        CourseMutation::PushItem { module_id, item } => match module_index(course, *module_id) {
            Some(mi) => {
                course.modules[mi].items.push(item.clone());
                true
            }
            None => false,
        },
        CourseMutation::SetItem { module_id, item_id, patch } => {
            let Some(mi) = module_index(course, *module_id) else {
                return false;
            };
            let items = &mut course.modules[mi].items;
            match items.iter().position(|i| i.id == *item_id) {
                Some(ii) => {
                    patch.apply(&mut items[ii]);
                    true
                }
                None => false,
            }
        }
        CourseMutation::PullItem { module_id, item_id } => {
            let Some(mi) = module_index(course, *module_id) else {
                return false;
            };
            let items = &mut course.modules[mi].items;
            match items.iter().position(|i| i.id == *item_id) {
                Some(ii) => {
                    items.remove(ii);
                    true
                }
                None => false,
            }
        }
    }
}

fn sort_courses(courses: &mut [Course], sort: CourseSort) {
    match sort {
        CourseSort::CreatedAtDesc => courses.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        CourseSort::CreatedAtAsc => courses.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        CourseSort::TitleAsc => courses.sort_by(|a, b| a.title.cmp(&b.title)),
        CourseSort::TitleDesc => courses.sort_by(|a, b| b.title.cmp(&a.title)),
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_course(&self, course: &Course) -> StoreResult<Course> {
        let mut db = self.inner.write();
        if db.courses.iter().any(|c| c.id == course.id) {
            return Err(StoreError::DuplicateKey("course".into()));
        }
        db.courses.push(course.clone());
        Ok(course.clone())
    }

    async fn find_course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        Ok(self.inner.read().courses.iter().find(|c| c.id == id).cloned())
    }

    async fn find_courses(&self, query: &CourseQuery) -> StoreResult<Vec<Course>> {
        let db = self.inner.read();
        let mut hits: Vec<Course> = db
            .courses
            .iter()
            .filter(|c| matches(&query.filter, c))
            .cloned()
            .collect();
        sort_courses(&mut hits, query.sort);
        Ok(hits
            .into_iter()
            .skip(usize::try_from(query.skip).unwrap_or(usize::MAX))
            .take(usize::try_from(query.limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn count_courses(&self, filter: &CourseFilter) -> StoreResult<u64> {
        let db = self.inner.read();
        Ok(db.courses.iter().filter(|c| matches(filter, c)).count() as u64)
    }

    async fn update_course(
        &self,
        id: Uuid,
        mutation: &CourseMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome> {
        let mut db = self.inner.write();
        let Some(course) = db.courses.iter_mut().find(|c| c.id == id) else {
            return Ok(UpdateOutcome::default());
        };
        if apply(course, mutation) {
            course.updated_at = at;
            Ok(UpdateOutcome { matched: 1, modified: 1 })
        } else {
            Ok(UpdateOutcome { matched: 1, modified: 0 })
        }
    }

    async fn delete_course(&self, id: Uuid) -> StoreResult<u64> {
        let mut db = self.inner.write();
        let before = db.courses.len();
        db.courses.retain(|c| c.id != id);
        Ok((before - db.courses.len()) as u64)
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<Enrollment> {
        let mut db = self.inner.write();
        let taken = db.enrollments.iter().any(|e| {
            e.id == enrollment.id
                || (e.user_id == enrollment.user_id && e.course_id == enrollment.course_id)
        });
        if taken {
            return Err(StoreError::DuplicateKey("enrollment".into()));
        }
        db.enrollments.push(enrollment.clone());
        Ok(enrollment.clone())
    }

    async fn find_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let db = self.inner.read();
        Ok(db
            .enrollments
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_enrollment(&self, id: Uuid, user_id: Uuid) -> StoreResult<u64> {
        let mut db = self.inner.write();
        let before = db.enrollments.len();
        db.enrollments
            .retain(|e| !(e.id == id && e.user_id == user_id));
        Ok((before - db.enrollments.len()) as u64)
    }

    async fn delete_enrollments_by_course(&self, course_id: Uuid) -> StoreResult<u64> {
        let mut db = self.inner.write();
        let before = db.enrollments.len();
        db.enrollments.retain(|e| e.course_id != course_id);
        Ok((before - db.enrollments.len()) as u64)
    }

    async fn touch_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome> {
        let mut db = self.inner.write();
        match db
            .enrollments
            .iter_mut()
            .find(|e| e.user_id == user_id && e.course_id == course_id)
        {
            Some(e) => {
                e.last_access_at = Some(at);
                Ok(UpdateOutcome { matched: 1, modified: 1 })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn upsert_progress(
        &self,
        key: ProgressKey,
        status: ProgressStatus,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<Progress> {
        let mut db = self.inner.write();
        let existing = db.progress.iter_mut().find(|p| {
            p.user_id == key.user_id && p.course_id == key.course_id && p.item_id == key.item_id
        });
        match existing {
            Some(row) => {
                row.status = status;
                row.score = score;
                row.updated_at = at;
                row.attempts += 1;
                Ok(row.clone())
            }
            None => {
                let row = Progress {
                    id: Uuid::new_v4(),
                    user_id: key.user_id,
                    course_id: key.course_id,
                    item_id: key.item_id,
                    status,
                    score,
                    attempts: 1,
                    updated_at: at,
                };
                db.progress.push(row.clone());
                Ok(row)
            }
        }
    }

    async fn course_progress(&self, user_id: Uuid) -> StoreResult<Vec<CourseProgress>> {
        let db = self.inner.read();
        let courses: HashMap<Uuid, &Course> = db.courses.iter().map(|c| (c.id, c)).collect();

        let mut rows = Vec::new();
        for enrollment in db.enrollments.iter().filter(|e| e.user_id == user_id) {
            // enrollments whose course is gone drop out of the join
            let Some(course) = courses.get(&enrollment.course_id) else {
                continue;
            };
            let mine: Vec<&Progress> = db
                .progress
                .iter()
                .filter(|p| p.user_id == user_id && p.course_id == course.id)
                .collect();
            let items_count = items_count(course);
            let done_count = mine
                .iter()
                .filter(|p| p.status == ProgressStatus::Done)
                .count() as i64;
            let avg_score = if mine.is_empty() {
                0.0
            } else {
                mine.iter().map(|p| p.score).sum::<f64>() / mine.len() as f64
            };
            rows.push(CourseProgress {
                course_id: course.id,
                course_title: course.title.clone(),
                items_count,
                done_count,
                completion_rate: completion_rate(done_count, items_count),
                avg_score,
                enrollment_status: enrollment.status.clone(),
                enrolled_at: enrollment.enrolled_at,
            });
        }
        rows.sort_by(|a, b| {
            b.completion_rate
                .total_cmp(&a.completion_rate)
                .then_with(|| a.course_title.cmp(&b.course_title))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, Module, ModulePatch};

    fn course_with(modules: Vec<Module>) -> Course {
        let now = Utc::now();
        Course {
            id: Uuid::new_v4(),
            title: "Rust".into(),
            description: None,
            category: "dev".into(),
            teacher_id: Uuid::new_v4(),
            modules,
            created_at: now,
            updated_at: now,
        }
    }

    fn module(title: &str) -> Module {
        Module { id: Uuid::new_v4(), title: title.into(), order: 0, items: vec![] }
    }

    #[tokio::test]
    async fn missing_module_reports_match_without_modification() {
        let store = MemoryStore::new();
        let course = store.insert_course(&course_with(vec![module("a")])).await.unwrap();

        let out = store
            .update_course(
                course.id,
                &CourseMutation::SetModule {
                    module_id: Uuid::new_v4(),
                    patch: ModulePatch { title: Some("x".into()), order: None },
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(out, UpdateOutcome { matched: 1, modified: 0 });

        let stored = store.find_course(course.id).await.unwrap().unwrap();
        assert_eq!(stored, course);
    }

    #[tokio::test]
    async fn push_item_targets_one_module() {
        let store = MemoryStore::new();
        let (a, b) = (module("a"), module("b"));
        let course = store.insert_course(&course_with(vec![a.clone(), b.clone()])).await.unwrap();
        let item = Item {
            id: Uuid::new_v4(),
            kind: "quiz".into(),
            title: "Q1".into(),
            max_score: 10.0,
            order: 1,
        };

        let out = store
            .update_course(
                course.id,
                &CourseMutation::PushItem { module_id: b.id, item: item.clone() },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(out.modified, 1);

        let stored = store.find_course(course.id).await.unwrap().unwrap();
        assert_eq!(stored.modules[0], a);
        assert_eq!(stored.modules[1].items, vec![item]);
    }

    #[tokio::test]
    async fn unique_enrollment_key_is_enforced() {
        let store = MemoryStore::new();
        let (user, course) = (Uuid::new_v4(), Uuid::new_v4());
        let row = |id| Enrollment {
            id,
            user_id: user,
            course_id: course,
            status: "active".into(),
            enrolled_at: Utc::now(),
            last_access_at: None,
        };
        store.insert_enrollment(&row(Uuid::new_v4())).await.unwrap();
        let err = store.insert_enrollment(&row(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }
}
