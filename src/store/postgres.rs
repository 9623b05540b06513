//! PostgreSQL-backed store.
//!
//! A course is one row whose module tree lives in the `modules` JSONB column.
//! Nested mutations are single `UPDATE` statements that rebuild only the
//! targeted array element; the guard on the element sits in the `WHERE`
//! clause so it is re-checked against the latest row version under
//! concurrent writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{types::Json, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{
    CourseFilter, CourseMutation, CourseQuery, CourseSort, EntityStore, StoreError, StoreResult,
    UpdateOutcome,
};
use crate::db::Db;
use crate::models::{
    Course, CourseProgress, Enrollment, Module, Progress, ProgressKey, ProgressStatus,
};

const COURSE_COLUMNS: &str =
    "id, title, description, category, teacher_id, modules, created_at, updated_at";

const PROGRESS_COLUMNS: &str =
    "id, user_id, course_id, item_id, status, score, attempts, updated_at";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

// Logged once, where the error surfaces as a 500.
fn store_err(entity: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateKey(entity.to_string())
        }
        _ => StoreError::Unavailable(format!("{entity}: {e}")),
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    category: String,
    teacher_id: Uuid,
    modules: Json<Vec<Module>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CourseRow> for Course {
    fn from(r: CourseRow) -> Self {
        Course {
            id: r.id,
            title: r.title,
            description: r.description,
            category: r.category,
            teacher_id: r.teacher_id,
            modules: r.modules.0,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    item_id: Uuid,
    status: String,
    score: f64,
    attempts: i32,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProgressRow> for Progress {
    type Error = StoreError;

    fn try_from(r: ProgressRow) -> Result<Self, Self::Error> {
        let status: ProgressStatus = r.status.parse().map_err(StoreError::Unavailable)?;
        Ok(Progress {
            id: r.id,
            user_id: r.user_id,
            course_id: r.course_id,
            item_id: r.item_id,
            status,
            score: r.score,
            attempts: r.attempts,
            updated_at: r.updated_at,
        })
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &CourseFilter) {
    qb.push(" WHERE TRUE");
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", escape_like(search));
        qb.push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(teacher_id) = filter.teacher_id {
        qb.push(" AND teacher_id = ").push_bind(teacher_id);
    }
}

fn order_clause(sort: CourseSort) -> &'static str {
    match sort {
        CourseSort::CreatedAtDesc => " ORDER BY created_at DESC, id",
        CourseSort::CreatedAtAsc => " ORDER BY created_at ASC, id",
        CourseSort::TitleAsc => " ORDER BY title ASC, id",
        CourseSort::TitleDesc => " ORDER BY title DESC, id",
    }
}

/// Wraps a `SET` expression and element guard into one statement reporting
/// how many courses matched `$1` and how many were actually rewritten.
fn update_sql(set: &str, guard: &str) -> String {
    format!(
        "WITH target AS (SELECT id FROM courses WHERE id = $1), \
         upd AS (UPDATE courses SET {set}, updated_at = $2 \
                 WHERE id = $1 AND {guard} RETURNING id) \
         SELECT (SELECT count(*) FROM target) AS matched, \
                (SELECT count(*) FROM upd) AS modified"
    )
}

// Rebuilds the module array, replacing each module `m` with `expr` when its
// id equals $3. Element order is preserved through WITH ORDINALITY.
fn map_modules(expr: &str) -> String {
    format!(
        "modules = (SELECT jsonb_agg(CASE WHEN m->>'id' = $3 THEN {expr} ELSE m END ORDER BY mo) \
                    FROM jsonb_array_elements(modules) WITH ORDINALITY AS mt(m, mo))"
    )
}

fn mutation_sql(mutation: &CourseMutation) -> String {
    match mutation {
        CourseMutation::SetFields(_) => update_sql(
            "title = COALESCE($3, title), \
             category = COALESCE($4, category), \
             description = CASE WHEN $5 THEN $6 ELSE description END",
            "TRUE",
        ),
        CourseMutation::PushModule(_) => {
            update_sql("modules = modules || jsonb_build_array($3::jsonb)", "TRUE")
        }
        CourseMutation::SetModule { .. } => {
            update_sql(&map_modules("m || $4::jsonb"), "modules @> $5::jsonb")
        }
        CourseMutation::PullModule { .. } => update_sql(
            "modules = COALESCE((SELECT jsonb_agg(m ORDER BY mo) \
                 FROM jsonb_array_elements(modules) WITH ORDINALITY AS mt(m, mo) \
                 WHERE m->>'id' <> $3), '[]'::jsonb)",
            "modules @> $4::jsonb",
        ),
        CourseMutation::PushItem { .. } => update_sql(
            &map_modules(
                "jsonb_set(m, '{items}', COALESCE(m->'items', '[]'::jsonb) || jsonb_build_array($4::jsonb))",
            ),
            "modules @> $5::jsonb",
        ),
        CourseMutation::SetItem { .. } => update_sql(
            &map_modules(
                "jsonb_set(m, '{items}', (SELECT jsonb_agg(CASE WHEN i->>'id' = $4 THEN i || $5::jsonb ELSE i END ORDER BY io) \
                     FROM jsonb_array_elements(m->'items') WITH ORDINALITY AS it(i, io)))",
            ),
            "modules @> $6::jsonb",
        ),
        CourseMutation::PullItem { .. } => update_sql(
            &map_modules(
                "jsonb_set(m, '{items}', COALESCE((SELECT jsonb_agg(i ORDER BY io) \
                     FROM jsonb_array_elements(m->'items') WITH ORDINALITY AS it(i, io) \
                     WHERE i->>'id' <> $4), '[]'::jsonb))",
            ),
            "modules @> $5::jsonb",
        ),
    }
}

fn module_guard(module_id: Uuid) -> Json<serde_json::Value> {
    Json(json!([{ "id": module_id }]))
}

fn item_guard(module_id: Uuid, item_id: Uuid) -> Json<serde_json::Value> {
    Json(json!([{ "id": module_id, "items": [{ "id": item_id }] }]))
}

#[async_trait]
impl EntityStore for PgStore {
    async fn insert_course(&self, course: &Course) -> StoreResult<Course> {
        let sql = format!(
            "INSERT INTO courses ({COURSE_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8) RETURNING {COURSE_COLUMNS}"
        );
        let row: CourseRow = sqlx::query_as(&sql)
            .bind(course.id)
            .bind(&course.title)
            .bind(&course.description)
            .bind(&course.category)
            .bind(course.teacher_id)
            .bind(Json(course.modules.clone()))
            .bind(course.created_at)
            .bind(course.updated_at)
            .fetch_one(&self.db)
            .await
            .map_err(store_err("course"))?;
        Ok(row.into())
    }

    async fn find_course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = $1");
        let row: Option<CourseRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(store_err("course"))?;
        Ok(row.map(Course::from))
    }

    async fn find_courses(&self, query: &CourseQuery) -> StoreResult<Vec<Course>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COURSE_COLUMNS} FROM courses"));
        push_filter(&mut qb, &query.filter);
        qb.push(order_clause(query.sort));
        qb.push(" LIMIT ").push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));
        qb.push(" OFFSET ").push_bind(i64::try_from(query.skip).unwrap_or(i64::MAX));
        let rows = qb
            .build_query_as::<CourseRow>()
            .fetch_all(&self.db)
            .await
            .map_err(store_err("course"))?;
        Ok(rows.into_iter().map(Course::from).collect())
    }

    async fn count_courses(&self, filter: &CourseFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT count(*) FROM courses");
        push_filter(&mut qb, filter);
        let (n,) = qb
            .build_query_as::<(i64,)>()
            .fetch_one(&self.db)
            .await
            .map_err(store_err("course"))?;
        Ok(n as u64)
    }

    async fn update_course(
        &self,
        id: Uuid,
        mutation: &CourseMutation,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome> {
        let sql = mutation_sql(mutation);
        let q = sqlx::query_as::<_, (i64, i64)>(&sql).bind(id).bind(at);
        let q = match mutation {
            CourseMutation::SetFields(patch) => q
                .bind(patch.title.clone())
                .bind(patch.category.clone())
                .bind(patch.description.is_some())
                .bind(patch.description.clone().flatten()),
            CourseMutation::PushModule(module) => q.bind(Json(module.clone())),
            CourseMutation::SetModule { module_id, patch } => q
                .bind(module_id.to_string())
                .bind(Json(patch.clone()))
                .bind(module_guard(*module_id)),
            CourseMutation::PullModule { module_id } => q
                .bind(module_id.to_string())
                .bind(module_guard(*module_id)),
            CourseMutation::PushItem { module_id, item } => q
                .bind(module_id.to_string())
                .bind(Json(item.clone()))
                .bind(module_guard(*module_id)),
            CourseMutation::SetItem { module_id, item_id, patch } => q
                .bind(module_id.to_string())
                .bind(item_id.to_string())
                .bind(Json(patch.clone()))
                .bind(item_guard(*module_id, *item_id)),
            CourseMutation::PullItem { module_id, item_id } => q
                .bind(module_id.to_string())
                .bind(item_id.to_string())
                .bind(item_guard(*module_id, *item_id)),
        };
        let (matched, modified) = q.fetch_one(&self.db).await.map_err(store_err("course"))?;
        Ok(UpdateOutcome { matched: matched as u64, modified: modified as u64 })
    }

    async fn delete_course(&self, id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM courses WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(store_err("course"))?;
        Ok(res.rows_affected())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<Enrollment> {
        sqlx::query_as(
            r#"
            INSERT INTO enrollments (id, user_id, course_id, status, enrolled_at, last_access_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING id, user_id, course_id, status, enrolled_at, last_access_at
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.user_id)
        .bind(enrollment.course_id)
        .bind(&enrollment.status)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.last_access_at)
        .fetch_one(&self.db)
        .await
        .map_err(store_err("enrollment"))
    }

    async fn find_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        sqlx::query_as(
            "SELECT id, user_id, course_id, status, enrolled_at, last_access_at \
             FROM enrollments WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(store_err("enrollment"))
    }

    async fn delete_enrollment(&self, id: Uuid, user_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM enrollments WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.db)
            .await
            .map_err(store_err("enrollment"))?;
        Ok(res.rows_affected())
    }

    async fn delete_enrollments_by_course(&self, course_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM enrollments WHERE course_id = $1")
            .bind(course_id)
            .execute(&self.db)
            .await
            .map_err(store_err("enrollment"))?;
        Ok(res.rows_affected())
    }

    async fn touch_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<UpdateOutcome> {
        let res = sqlx::query(
            "UPDATE enrollments SET last_access_at = $3 WHERE user_id = $1 AND course_id = $2",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(at)
        .execute(&self.db)
        .await
        .map_err(store_err("enrollment"))?;
        let n = res.rows_affected();
        Ok(UpdateOutcome { matched: n, modified: n })
    }

    async fn upsert_progress(
        &self,
        key: ProgressKey,
        status: ProgressStatus,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<Progress> {
        // attempts is bumped by the database, never read back and rewritten
        let sql = format!(
            "INSERT INTO progress ({PROGRESS_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,1,$7) \
             ON CONFLICT (user_id, course_id, item_id) \
             DO UPDATE SET status = EXCLUDED.status, score = EXCLUDED.score, \
                           updated_at = EXCLUDED.updated_at, attempts = progress.attempts + 1 \
             RETURNING {PROGRESS_COLUMNS}"
        );
        let row: ProgressRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(key.user_id)
            .bind(key.course_id)
            .bind(key.item_id)
            .bind(status.as_str())
            .bind(score)
            .bind(at)
            .fetch_one(&self.db)
            .await
            .map_err(store_err("progress"))?;
        row.try_into()
    }

    async fn course_progress(&self, user_id: Uuid) -> StoreResult<Vec<CourseProgress>> {
        sqlx::query_as(
            r#"
            SELECT agg.*,
                   CASE WHEN agg.items_count > 0
                        THEN agg.done_count::DOUBLE PRECISION / agg.items_count
                        ELSE 0 END::DOUBLE PRECISION AS completion_rate
            FROM (
                SELECT c.id AS course_id,
                       c.title AS course_title,
                       COALESCE((SELECT SUM(jsonb_array_length(COALESCE(m->'items', '[]'::jsonb)))
                                 FROM jsonb_array_elements(c.modules) AS m), 0)::BIGINT AS items_count,
                       COUNT(p.id) FILTER (WHERE p.status = 'done') AS done_count,
                       COALESCE(AVG(p.score), 0)::DOUBLE PRECISION AS avg_score,
                       e.status AS enrollment_status,
                       e.enrolled_at AS enrolled_at
                FROM enrollments e
                JOIN courses c ON c.id = e.course_id
                LEFT JOIN progress p ON p.user_id = e.user_id AND p.course_id = e.course_id
                WHERE e.user_id = $1
                GROUP BY e.id, c.id
            ) AS agg
            ORDER BY completion_rate DESC, agg.course_title ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(store_err("progress"))
    }
}
