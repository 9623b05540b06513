use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub teacher_id: Uuid,
    pub modules: Vec<Module>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Module and Item are stored inside the course document, so their serde
// shape is also the persisted JSONB shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub max_score: f64,
    #[serde(default)]
    pub order: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: String,
    pub enrolled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<DateTime<Utc>>,
}

pub const ENROLLMENT_ACTIVE: &str = "active";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Done,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Done => "done",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(ProgressStatus::NotStarted),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "done" => Ok(ProgressStatus::Done),
            other => Err(format!("invalid status: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub item_id: Uuid,
    pub status: ProgressStatus,
    pub score: f64,
    pub attempts: i32,
    pub updated_at: DateTime<Utc>,
}

/// Unique key of a progress row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub item_id: Uuid,
}

/// Read-only projection produced by the progress aggregation.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    pub course_id: Uuid,
    pub course_title: String,
    pub items_count: i64,
    pub done_count: i64,
    pub completion_rate: f64,
    pub avg_score: f64,
    pub enrollment_status: String,
    pub enrolled_at: DateTime<Utc>,
}

// --- request payloads ---

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewCourseReq {
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub teacher_id: String,
    #[serde(default)]
    pub modules: Vec<NewModuleReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewModuleReq {
    /// Client-assigned id; kept when it parses, replaced otherwise.
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub items: Vec<NewItemReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewItemReq {
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub max_score: f64,
    #[serde(default)]
    pub order: i32,
}

/// Partial course update. `None` means the field was omitted; for
/// `description`, `Some(None)` clears it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoursePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl CoursePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.category.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

impl ModulePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.order.is_none()
    }

    pub fn apply(&self, module: &mut Module) {
        if let Some(title) = &self.title {
            module.title = title.clone();
        }
        if let Some(order) = self.order {
            module.order = order;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.title.is_none() && self.max_score.is_none() && self.order.is_none()
    }

    pub fn apply(&self, item: &mut Item) {
        if let Some(kind) = &self.kind {
            item.kind = kind.clone();
        }
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(max_score) = self.max_score {
            item.max_score = max_score;
        }
        if let Some(order) = self.order {
            item.order = order;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnrollmentReq {
    #[serde(default)]
    pub course_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressReq {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub score: f64,
}

/// Listing envelope returned by paginated endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub limit: u64,
    pub total: u64,
}
