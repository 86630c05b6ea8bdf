use super::AppState;
use crate::{
    auth::{AuthUser, Member},
    error::{MarketError, Result},
    model::{Medicine, MedicineView, NewMedicine, SearchFilters},
    uploads, MedicineId,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;

pub async fn create(
    State(state): State<AppState>,
    member: Member,
    Json(listing): Json<NewMedicine>,
) -> Result<(StatusCode, Json<Medicine>)> {
    listing.validate(Utc::now().date_naive())?;

    let image = listing
        .image_base64
        .as_deref()
        .filter(|encoded| !encoded.trim().is_empty())
        .map(|encoded| uploads::decode_image(encoded, state.config.storage.max_upload_bytes))
        .transpose()?;

    let report = state
        .verifier
        .verify_listing(
            &listing,
            image.as_ref().map(|image| (image.bytes.as_slice(), image.kind.mime_type())),
        )
        .await;
    let report_value = serde_json::to_value(&report)?;

    let upload_dir = &state.config.storage.upload_dir;
    let image_url = match &image {
        Some(image) => Some(uploads::save_image(upload_dir, image).await?),
        None => None,
    };

    let medicine = match state
        .db
        .create_medicine(member.id, &listing, image_url.clone(), Some(report_value))
        .await
    {
        Ok(medicine) => medicine,
        Err(e) => {
            if let Some(url) = &image_url {
                uploads::remove_image(upload_dir, url).await;
            }
            return Err(e);
        }
    };

    tracing::info!(
        medicine_id = %medicine.id,
        sender_id = %member.id,
        verdict = ?report.verdict,
        "listing submitted for review"
    );

    Ok((StatusCode::CREATED, Json(medicine)))
}

pub async fn search(
    State(state): State<AppState>,
    _member: Member,
    Query(filters): Query<SearchFilters>,
) -> Result<Json<Vec<MedicineView>>> {
    Ok(Json(state.db.search_medicines(&filters).await?))
}

pub async fn mine(State(state): State<AppState>, member: Member) -> Result<Json<Vec<Medicine>>> {
    Ok(Json(state.db.list_medicines_by_sender(member.id).await?))
}

/// Approved listings are visible to every signed-in user; others only to their sender and admins.
pub async fn get_one(
    State(state): State<AppState>,
    user: AuthUser,
    Path(medicine_id): Path<MedicineId>,
) -> Result<Json<MedicineView>> {
    let view = state
        .db
        .get_medicine(medicine_id)
        .await?
        .ok_or_else(|| MarketError::NotFound("Medicine".to_string()))?;

    let visible = view.medicine.is_approved()
        || user.is_admin()
        || user.user_id().is_ok_and(|id| id == view.medicine.sender_id);
    if !visible {
        return Err(MarketError::NotFound("Medicine".to_string()));
    }

    Ok(Json(view))
}
