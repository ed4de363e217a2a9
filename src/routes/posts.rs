use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::post::{CreatePostRequest, Post},
    models::user::Role,
    services::authz::{self, Capability},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/posts — the school feed, newest first.
pub async fn list_posts(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    _user: AuthenticatedUser,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(25).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let rows: Vec<(Uuid, Uuid, String, chrono::DateTime<chrono::Utc>, String, String)> =
        sqlx::query_as(
            "SELECT p.id, p.author_id, p.content, p.created_at, a.first_name, a.last_name
             FROM posts p
             JOIN profiles a ON a.id = p.author_id
             WHERE p.school_id = $1
             ORDER BY p.created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(school.id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.db)
        .await?;

    let feed: Vec<Value> = rows
        .into_iter()
        .map(|(id, author_id, content, created_at, first_name, last_name)| {
            json!({
                "id": id,
                "author_id": author_id,
                "author_name": format!("{first_name} {last_name}"),
                "content": content,
                "created_at": created_at,
            })
        })
        .collect();

    Ok(Json(json!(feed)))
}

/// POST /api/posts — creates a post and fans out mention notifications.
/// A failed mention notification never fails the post.
pub async fn create_post(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), ApiError> {
    authz::require(&user, Capability::PostToFeed)?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err(ApiError::bad_request("Post content is required"));
    }
    if content.len() > 5_000 {
        return Err(ApiError::bad_request("Post content is too long"));
    }

    let post: Post = sqlx::query_as(
        "INSERT INTO posts (school_id, author_id, content) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(school.id)
    .bind(user.profile_id)
    .bind(content)
    .fetch_one(&state.db)
    .await?;

    if !body.mention_ids.is_empty() {
        // Only mentions that resolve to members of this school fan out.
        let mentioned: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM profiles
             WHERE id = ANY($1) AND school_id = $2 AND is_active = TRUE",
        )
        .bind(&body.mention_ids)
        .bind(school.id)
        .fetch_all(&state.db)
        .await?;

        let author_name: String = sqlx::query_scalar(
            "SELECT first_name || ' ' || last_name FROM profiles WHERE id = $1",
        )
        .bind(user.profile_id)
        .fetch_one(&state.db)
        .await?;

        for (mention_id,) in mentioned {
            if mention_id == user.profile_id {
                continue;
            }
            state
                .notifications
                .notify(
                    &state.db,
                    school.id,
                    mention_id,
                    "mention",
                    "You were mentioned",
                    &format!("{author_name} mentioned you in a post."),
                    Some(json!({ "post_id": post.id })),
                )
                .await;
        }
    }

    Ok((StatusCode::CREATED, Json(post)))
}

/// DELETE /api/posts/{id} — the author or school management.
pub async fn delete_post(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(post_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let author_id: Option<Uuid> =
        sqlx::query_scalar("SELECT author_id FROM posts WHERE id = $1 AND school_id = $2")
            .bind(post_id)
            .bind(school.id)
            .fetch_optional(&state.db)
            .await?;

    let author_id = author_id.ok_or_else(|| ApiError::not_found("Post not found"))?;

    if author_id != user.profile_id && !matches!(user.role, Role::Owner | Role::Admin) {
        return Err(ApiError::Forbidden("You cannot delete this post"));
    }

    sqlx::query("DELETE FROM posts WHERE id = $1")
        .bind(post_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}
