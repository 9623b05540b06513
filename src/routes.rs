use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::courses::ListParams;
use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::service::{parse_id, Service};
use crate::sessions::{CurrentUser, SessionResolver};

#[derive(Clone)]
pub struct AppState {
    pub service: Service,
    pub sessions: Arc<dyn SessionResolver>,
}

type JsonBody<T> = WithRejection<Json<T>, AppError>;
type PathIds<T> = WithRejection<Path<T>, AppError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        // catalog
        .route("/courses", get(list_courses).post(create_course))
        .route(
            "/courses/:id",
            get(get_course).patch(patch_course).delete(delete_course),
        )
        .route("/courses/:id/modules", post(add_module))
        .route(
            "/courses/:id/modules/:module_id",
            patch(patch_module).delete(delete_module),
        )
        .route("/courses/:id/modules/:module_id/items", post(add_item))
        .route(
            "/courses/:id/modules/:module_id/items/:item_id",
            patch(patch_item).delete(delete_item),
        )
        // progress
        .route("/courses/:id/items/:item_id/progress", put(record_progress))
        .route("/progress/me", get(my_progress))
        // enrollments
        .route(
            "/enrollments",
            post(create_enrollment).delete(delete_enrollments_by_course),
        )
        .route("/enrollments/me", get(my_enrollments))
        .route("/enrollments/:id", axum::routing::delete(delete_enrollment))
        .with_state(state)
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": text }))
}

// --- courses ---

async fn list_courses(
    State(st): State<AppState>,
    WithRejection(Query(params), _): WithRejection<Query<ListParams>, AppError>,
) -> AppResult<Json<Page<Course>>> {
    Ok(Json(st.service.list_courses(&params).await?))
}

async fn create_course(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Json(req), _): JsonBody<NewCourseReq>,
) -> AppResult<impl IntoResponse> {
    let course = st.service.create_course(req).await?;
    Ok((StatusCode::CREATED, Json(course)))
}

async fn get_course(
    State(st): State<AppState>,
    WithRejection(Path(id), _): PathIds<Uuid>,
) -> AppResult<Json<Course>> {
    Ok(Json(st.service.get_course(id).await?))
}

async fn patch_course(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path(id), _): PathIds<Uuid>,
    WithRejection(Json(patch), _): JsonBody<CoursePatch>,
) -> AppResult<Json<Course>> {
    Ok(Json(st.service.patch_course(id, patch).await?))
}

async fn delete_course(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path(id), _): PathIds<Uuid>,
) -> AppResult<impl IntoResponse> {
    st.service.delete_course(id).await?;
    Ok(message("course deleted"))
}

// --- modules and items ---

async fn add_module(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path(id), _): PathIds<Uuid>,
    WithRejection(Json(req), _): JsonBody<NewModuleReq>,
) -> AppResult<impl IntoResponse> {
    let module = st.service.add_module(id, req).await?;
    Ok((StatusCode::CREATED, Json(module)))
}

async fn patch_module(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path((id, module_id)), _): PathIds<(Uuid, Uuid)>,
    WithRejection(Json(patch), _): JsonBody<ModulePatch>,
) -> AppResult<impl IntoResponse> {
    st.service.patch_module(id, module_id, patch).await?;
    Ok(message("module updated"))
}

async fn delete_module(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path((id, module_id)), _): PathIds<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    st.service.delete_module(id, module_id).await?;
    Ok(message("module deleted"))
}

async fn add_item(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path((id, module_id)), _): PathIds<(Uuid, Uuid)>,
    WithRejection(Json(req), _): JsonBody<NewItemReq>,
) -> AppResult<impl IntoResponse> {
    let item = st.service.add_item(id, module_id, req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn patch_item(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path((id, module_id, item_id)), _): PathIds<(Uuid, Uuid, Uuid)>,
    WithRejection(Json(patch), _): JsonBody<ItemPatch>,
) -> AppResult<impl IntoResponse> {
    st.service.patch_item(id, module_id, item_id, patch).await?;
    Ok(message("item updated"))
}

async fn delete_item(
    State(st): State<AppState>,
    CurrentUser(_): CurrentUser,
    WithRejection(Path((id, module_id, item_id)), _): PathIds<(Uuid, Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    st.service.delete_item(id, module_id, item_id).await?;
    Ok(message("item deleted"))
}

// --- progress ---

async fn record_progress(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    WithRejection(Path((course_id, item_id)), _): PathIds<(Uuid, Uuid)>,
    WithRejection(Json(req), _): JsonBody<ProgressReq>,
) -> AppResult<Json<Progress>> {
    let row = st
        .service
        .record_progress(user_id, course_id, item_id, &req.status, req.score)
        .await?;
    Ok(Json(row))
}

async fn my_progress(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> AppResult<Json<Vec<CourseProgress>>> {
    Ok(Json(st.service.my_progress(user_id).await?))
}

// --- enrollments ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CourseIdQuery {
    course_id: Option<String>,
}

async fn create_enrollment(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    WithRejection(Json(req), _): JsonBody<CreateEnrollmentReq>,
) -> AppResult<impl IntoResponse> {
    let course_id = parse_id(&req.course_id, "courseId")?;
    let enrollment = st.service.enroll(user_id, course_id).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn my_enrollments(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> AppResult<Json<Vec<Enrollment>>> {
    Ok(Json(st.service.list_my_enrollments(user_id).await?))
}

async fn delete_enrollment(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    WithRejection(Path(id), _): PathIds<Uuid>,
) -> AppResult<impl IntoResponse> {
    st.service.delete_enrollment(user_id, id).await?;
    Ok(message("enrollment deleted"))
}

async fn delete_enrollments_by_course(
    State(st): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    WithRejection(Query(q), _): WithRejection<Query<CourseIdQuery>, AppError>,
) -> AppResult<impl IntoResponse> {
    let course_id = parse_id(q.course_id.as_deref().unwrap_or_default(), "courseId")?;
    let deleted = st.service.delete_enrollments_by_course(user_id, course_id).await?;
    Ok(Json(json!({ "deletedCount": deleted })))
}
