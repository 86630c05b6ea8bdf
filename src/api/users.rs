use super::AppState;
use crate::{
    auth::{AuthUser, ADMIN_SUBJECT},
    error::{MarketError, Result},
    model::{NewUser, Role, User},
};
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse<T> {
    pub token: String,
    pub user: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<NewUser>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    request.validate()?;
    let request = request.normalized();

    if state.db.get_user_by_email(&request.email).await?.is_some() {
        return Err(MarketError::Conflict("User already exists with this email".to_string()));
    }

    let password_hash = state.auth.hash_password(&request.password)?;
    let mut user = state.db.create_user(&request, &password_hash, None).await?;

    let report = serde_json::to_value(state.verifier.verify_registration(&request).await)?;
    state.db.attach_user_verification(user.id, &report).await?;
    user.verification = Some(report);
    tracing::info!(user_id = %user.id, user_type = user.user_type.as_str(), "registration received");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Registration submitted. An administrator will review your account.",
            "user": user,
        })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse<User>>> {
    let invalid = || MarketError::Auth("Invalid email or password".to_string());

    let user = state
        .db
        .get_user_by_email(&request.email)
        .await?
        .ok_or_else(invalid)?;

    if !state.auth.verify_password(&request.password, &user.password_hash)? {
        return Err(invalid());
    }

    match user.role {
        Role::Rejected => {
            return Err(MarketError::Forbidden("Registration was rejected".to_string()));
        }
        _ if !user.is_verified => {
            return Err(MarketError::Forbidden("Account is awaiting admin approval".to_string()));
        }
        _ => {}
    }

    let token = state.auth.issue_token(&user.id.to_string(), &user.email, user.role)?;
    tracing::info!(user_id = %user.id, "login");

    Ok(Json(TokenResponse { token, user }))
}

pub async fn admin_login(
    State(state): State<AppState>,
    Json(request): Json<AdminLoginRequest>,
) -> Result<Json<TokenResponse<AdminProfile>>> {
    if !state.auth.check_admin_credentials(&request.username, &request.password) {
        tracing::warn!(username = %request.username, "rejected admin login");
        return Err(MarketError::Auth("Invalid admin credentials".to_string()));
    }

    let email = state.auth.admin_email();
    let token = state.auth.issue_token(ADMIN_SUBJECT, &email, Role::Admin)?;

    Ok(Json(TokenResponse {
        token,
        user: AdminProfile {
            id: ADMIN_SUBJECT.to_string(),
            username: request.username,
            email,
            role: Role::Admin,
        },
    }))
}

pub async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<serde_json::Value>> {
    if user.is_admin() {
        return Ok(Json(serde_json::json!({
            "id": user.subject,
            "email": user.email,
            "role": Role::Admin,
        })));
    }

    let profile = state
        .db
        .get_user(user.user_id()?)
        .await?
        .ok_or_else(|| MarketError::NotFound("User".to_string()))?;

    Ok(Json(serde_json::to_value(profile)?))
}
