//! Course composition: the Course -> Module -> Item tree.
//!
//! Every mutation is handed to the store as one targeted [`CourseMutation`];
//! nothing here reads a course back to edit it. Module and item `order`
//! values are stored as given and never renumbered.

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Course, CoursePatch, Item, ItemPatch, Module, ModulePatch, NewCourseReq, NewItemReq,
    NewModuleReq, Page,
};
use crate::service::{parse_id, required, Service};
use crate::store::{CourseFilter, CourseMutation, CourseQuery, CourseSort, UpdateOutcome};

pub const DEFAULT_LIMIT: u64 = 10;
pub const MAX_LIMIT: u64 = 100;

/// Raw listing parameters as they arrive on the query string.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub search: Option<String>,
    pub category: Option<String>,
    pub teacher_id: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
}

impl Pagination {
    /// `page` must be >= 1. `limit` must be >= 1 and is clamped to
    /// [`MAX_LIMIT`]. Non-numeric values are rejected.
    pub fn parse(page: Option<&str>, limit: Option<&str>) -> AppResult<Self> {
        let page = match page.map(str::trim).filter(|s| !s.is_empty()) {
            None => 1,
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n >= 1 => n as u64,
                _ => return Err(AppError::invalid("invalid page")),
            },
        };
        let limit = match limit.map(str::trim).filter(|s| !s.is_empty()) {
            None => DEFAULT_LIMIT,
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n >= 1 => (n as u64).min(MAX_LIMIT),
                Ok(_) => return Err(AppError::invalid("invalid limit")),
                // beyond i64 is still a number, just a large one
                Err(_) if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) => MAX_LIMIT,
                Err(_) => return Err(AppError::invalid("invalid limit")),
            },
        };
        Ok(Pagination { page, limit })
    }

    /// Offset of the first row on this page, capped at `i64::MAX` so a huge
    /// page still maps to a valid (empty) offset.
    pub fn skip(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit).min(i64::MAX as u64)
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

impl ListParams {
    pub fn to_query(&self) -> AppResult<(CourseQuery, Pagination)> {
        let pagination = Pagination::parse(self.page.as_deref(), self.limit.as_deref())?;
        let teacher_id = match non_blank(self.teacher_id.as_ref()) {
            Some(raw) => Some(parse_id(&raw, "teacherId")?),
            None => None,
        };
        let sort = match non_blank(self.sort.as_ref()) {
            Some(raw) => CourseSort::parse(&raw).ok_or_else(|| AppError::invalid("invalid sort"))?,
            None => CourseSort::default(),
        };
        let query = CourseQuery {
            filter: CourseFilter {
                search: non_blank(self.search.as_ref()),
                category: non_blank(self.category.as_ref()),
                teacher_id,
            },
            sort,
            skip: pagination.skip(),
            limit: pagination.limit,
        };
        Ok((query, pagination))
    }
}

/// Keeps a caller-supplied id when it is well formed, otherwise mints one.
fn assign_id(raw: Option<&str>) -> Uuid {
    raw.and_then(|s| Uuid::parse_str(s.trim()).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn build_item(req: &NewItemReq) -> Item {
    Item {
        id: assign_id(req.id.as_deref()),
        kind: req.kind.trim().to_string(),
        title: req.title.trim().to_string(),
        max_score: req.max_score,
        order: req.order,
    }
}

fn build_module(req: &NewModuleReq) -> AppResult<Module> {
    Ok(Module {
        id: assign_id(req.id.as_deref()),
        title: required(&req.title, "module title")?,
        order: req.order,
        items: req.items.iter().map(build_item).collect(),
    })
}

fn check_title(title: &Option<String>, field: &str) -> AppResult<Option<String>> {
    match title {
        Some(t) => Ok(Some(required(t, field)?)),
        None => Ok(None),
    }
}

/// Maps the two-tier update outcome: no course, or course without the element.
fn expect_modified(outcome: UpdateOutcome, element: &str) -> AppResult<()> {
    if outcome.matched == 0 {
        Err(AppError::not_found("course not found"))
    } else if outcome.modified == 0 {
        Err(AppError::not_found(format!("{element} not found")))
    } else {
        Ok(())
    }
}

impl Service {
    pub async fn create_course(&self, req: NewCourseReq) -> AppResult<Course> {
        let title = required(&req.title, "title")?;
        let category = required(&req.category, "category")?;
        let teacher_id = parse_id(&req.teacher_id, "teacherId")?;
        let modules = req
            .modules
            .iter()
            .map(build_module)
            .collect::<AppResult<Vec<_>>>()?;

        let now = Utc::now();
        let course = Course {
            id: Uuid::new_v4(),
            title,
            description: req.description.map(|d| d.trim().to_string()),
            category,
            teacher_id,
            modules,
            created_at: now,
            updated_at: now,
        };
        let course = self.timed(self.store().insert_course(&course)).await?;
        tracing::info!(course_id = %course.id, teacher_id = %course.teacher_id, "course created");
        Ok(course)
    }

    pub async fn get_course(&self, id: Uuid) -> AppResult<Course> {
        self.timed(self.store().find_course(id))
            .await?
            .ok_or_else(|| AppError::not_found("course not found"))
    }

    pub async fn list_courses(&self, params: &ListParams) -> AppResult<Page<Course>> {
        let (query, pagination) = params.to_query()?;
        let items = self.timed(self.store().find_courses(&query)).await?;
        let total = self.timed(self.store().count_courses(&query.filter)).await?;
        Ok(Page {
            items,
            page: pagination.page,
            limit: pagination.limit,
            total,
        })
    }

    pub async fn patch_course(&self, id: Uuid, patch: CoursePatch) -> AppResult<Course> {
        if patch.is_empty() {
            return Err(AppError::invalid("no fields to update"));
        }
        let patch = CoursePatch {
            title: check_title(&patch.title, "title")?,
            category: check_title(&patch.category, "category")?,
            description: patch.description.map(|d| d.map(|s| s.trim().to_string())),
        };
        let outcome = self
            .timed(self.store().update_course(id, &CourseMutation::SetFields(patch), Utc::now()))
            .await?;
        expect_modified(outcome, "course")?;
        tracing::debug!(course_id = %id, "course patched");
        self.get_course(id).await
    }

    /// Removes the course only. Enrollments and progress rows that reference
    /// it stay until removed explicitly.
    pub async fn delete_course(&self, id: Uuid) -> AppResult<()> {
        let deleted = self.timed(self.store().delete_course(id)).await?;
        if deleted == 0 {
            return Err(AppError::not_found("course not found"));
        }
        tracing::info!(course_id = %id, "course deleted");
        Ok(())
    }

    pub async fn add_module(&self, course_id: Uuid, req: NewModuleReq) -> AppResult<Module> {
        let module = Module {
            id: Uuid::new_v4(),
            title: required(&req.title, "title")?,
            order: req.order,
            items: req.items.iter().map(build_item).collect(),
        };
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::PushModule(module.clone()),
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "course")?;
        tracing::info!(course_id = %course_id, module_id = %module.id, "module added");
        Ok(module)
    }

    pub async fn patch_module(
        &self,
        course_id: Uuid,
        module_id: Uuid,
        patch: ModulePatch,
    ) -> AppResult<()> {
        if patch.is_empty() {
            return Err(AppError::invalid("no fields to update"));
        }
        let patch = ModulePatch {
            title: check_title(&patch.title, "title")?,
            order: patch.order,
        };
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::SetModule { module_id, patch },
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "module")?;
        tracing::debug!(course_id = %course_id, module_id = %module_id, "module patched");
        Ok(())
    }

    pub async fn delete_module(&self, course_id: Uuid, module_id: Uuid) -> AppResult<()> {
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::PullModule { module_id },
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "module")?;
        tracing::info!(course_id = %course_id, module_id = %module_id, "module deleted");
        Ok(())
    }

    pub async fn add_item(
        &self,
        course_id: Uuid,
        module_id: Uuid,
        req: NewItemReq,
    ) -> AppResult<Item> {
        required(&req.title, "title")?;
        // server-assigned, unlike ids sent with a whole new course
        let item = build_item(&NewItemReq { id: None, ..req });
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::PushItem { module_id, item: item.clone() },
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "module")?;
        tracing::info!(course_id = %course_id, module_id = %module_id, item_id = %item.id, "item added");
        Ok(item)
    }

    pub async fn patch_item(
        &self,
        course_id: Uuid,
        module_id: Uuid,
        item_id: Uuid,
        patch: ItemPatch,
    ) -> AppResult<()> {
        if patch.is_empty() {
            return Err(AppError::invalid("no fields to update"));
        }
        let patch = ItemPatch {
            title: check_title(&patch.title, "title")?,
            ..patch
        };
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::SetItem { module_id, item_id, patch },
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "item")?;
        tracing::debug!(course_id = %course_id, item_id = %item_id, "item patched");
        Ok(())
    }

    pub async fn delete_item(
        &self,
        course_id: Uuid,
        module_id: Uuid,
        item_id: Uuid,
    ) -> AppResult<()> {
        let outcome = self
            .timed(self.store().update_course(
                course_id,
                &CourseMutation::PullItem { module_id, item_id },
                Utc::now(),
            ))
            .await?;
        expect_modified(outcome, "item")?;
        tracing::info!(course_id = %course_id, item_id = %item_id, "item deleted");
        Ok(())
    }
}
