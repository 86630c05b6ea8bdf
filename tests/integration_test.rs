use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use medcycle::{
    api::{build_router, AppState},
    config::AppConfig,
    database::Database,
    error::{MarketError, Result},
    model::{AddToCart, DeliveryStatus, NewMedicine, NewUser, PaymentStatus, UserType},
};
use serde_json::{json, Value};
use sha2::Sha256;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_PASSWORD: &str = "admin-pass";
const WEBHOOK_SECRET: &str = "whsec_test";

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

struct TestApp {
    router: Router,
    db: Database,
    upload_dir: PathBuf,
    _dir: TempDir,
}

async fn setup_test_app() -> TestApp {
    setup_test_app_with(|_| {}).await
}

async fn setup_test_app_with(configure: impl FnOnce(&mut AppConfig)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}", dir.path().join("medcycle.db").display());
    config.storage.upload_dir = dir.path().join("uploads");
    config.auth.jwt_secret = Some("integration-secret".to_string());
    config.auth.admin_password = Some(ADMIN_PASSWORD.to_string());
    config.payments.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
    configure(&mut config);

    let upload_dir = config.storage.upload_dir.clone();
    let state = AppState::new(config).await.unwrap();
    let db = state.db.clone();
    TestApp {
        router: build_router(state),
        db,
        upload_dir,
        _dir: dir,
    }
}

/// Stands in for the Stripe API: cancels any intent and accepts any refund.
#[derive(Clone, Default)]
struct StubStripe {
    cancels: Arc<AtomicUsize>,
    refunds: Arc<AtomicUsize>,
}

async fn spawn_stub_stripe() -> (String, StubStripe) {
    let stripe = StubStripe::default();
    let router = Router::new()
        .route(
            "/v1/payment_intents/:id/cancel",
            post(|State(stripe): State<StubStripe>, Path(id): Path<String>| async move {
                stripe.cancels.fetch_add(1, Ordering::SeqCst);
                Json(json!({"id": id, "amount": 8000, "currency": "inr", "status": "canceled"}))
            }),
        )
        .route(
            "/v1/refunds",
            post(|State(stripe): State<StubStripe>| async move {
                stripe.refunds.fetch_add(1, Ordering::SeqCst);
                Json(json!({"id": "re_1", "amount": 8000, "status": "succeeded"}))
            }),
        )
        .with_state(stripe.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", address), stripe)
}

fn signed_webhook(payload: &str) -> Request<Body> {
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let signature = format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()));

    Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("stripe-signature", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn succeeded_event(event_id: &str, intent_id: &str, order_id: &str) -> String {
    json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": intent_id,
            "amount": 8000,
            "currency": "inr",
            "status": "succeeded",
            "metadata": { "order_id": order_id }
        }}
    })
    .to_string()
}

async fn setup_test_db() -> Result<(Database, TempDir)> {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("store.db").display());
    Ok((Database::new(&url).await?, dir))
}

async fn send(app: &TestApp, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn registration(email: &str, organization: &str, user_type: &str, pin: &str) -> Value {
    json!({
        "email": email,
        "password": "s3cure-pass",
        "organizationName": organization,
        "ownerName": "Test Owner",
        "mobile": "+91 98765 43210",
        "pinCode": pin,
        "userType": user_type,
        "govIdNumber": "REG-1001",
    })
}

fn new_user(email: &str, pin: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        password: "s3cure-pass".to_string(),
        organization_name: format!("{} Pharmacy", pin),
        owner_name: "Owner".to_string(),
        mobile: "9876543210".to_string(),
        pin_code: pin.to_string(),
        user_type: UserType::Pharmacy,
        gov_id_number: Some("PH-1".to_string()),
        aadhaar_number: None,
    }
}

fn new_medicine(name: &str, quantity: i64, cost: f64) -> NewMedicine {
    NewMedicine {
        name: name.to_string(),
        company: "Cipla".to_string(),
        dosage: Some("500mg".to_string()),
        expiry_date: Utc::now().date_naive() + Duration::days(365),
        batch_number: "B-77".to_string(),
        quantity,
        cost_per_unit: cost,
        is_sealed: true,
        image_base64: None,
    }
}

async fn admin_token(app: &TestApp) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/admin-login",
        None,
        Some(json!({"username": "admin", "password": ADMIN_PASSWORD})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

/// Registers an organization through the API, approves it and returns `(id, token)`.
async fn approved_member(app: &TestApp, admin: &str, email: &str, organization: &str, pin: &str) -> (String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(registration(email, organization, "pharmacy", pin)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["user"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(app, "POST", &format!("/api/admin/users/{}/approve", id), Some(admin), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = login(app, email).await;
    assert_eq!(status, StatusCode::OK);
    (id, body["token"].as_str().unwrap().to_string())
}

async fn login(app: &TestApp, email: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": email, "password": "s3cure-pass"})),
    )
    .await
}

#[tokio::test]
async fn test_health_check() {
    let app = setup_test_app().await;
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_route_guards() {
    let app = setup_test_app().await;

    let (status, _) = send(&app, "GET", "/api/cart", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/api/cart", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/admin-login",
        None,
        Some(json!({"username": "admin", "password": "guess"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let admin = admin_token(&app).await;
    let (status, _) = send(&app, "GET", "/api/cart", Some(&admin), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, "GET", "/api/auth/me", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "admin");
}

#[tokio::test]
async fn test_registration_requires_approval() {
    let app = setup_test_app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(registration("stores@cityhospital.in", "City Hospital", "hospital", "560001")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["role"], "pending");
    assert!(body["user"].get("passwordHash").is_none());
    assert_eq!(body["user"]["verification"]["verdict"], "manual_review");
    let user_id = body["user"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(registration("stores@cityhospital.in", "City Hospital", "hospital", "560001")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = login(&app, "stores@cityhospital.in").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"].as_str().unwrap().contains("awaiting admin approval"));

    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"email": "stores@cityhospital.in", "password": "wrong-password"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let admin = admin_token(&app).await;
    let (status, body) = send(&app, "GET", "/api/admin/pending-users", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/admin/users/{}/approve", user_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "sender_receiver");
    assert_eq!(body["isVerified"], true);

    let (status, body) = login(&app, "stores@cityhospital.in").await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap();

    let (status, body) = send(&app, "GET", "/api/auth/me", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["organizationName"], "City Hospital");
}

#[tokio::test]
async fn test_listing_to_delivery_flow() {
    let app = setup_test_app().await;
    let admin = admin_token(&app).await;

    let mut tokens = Vec::new();
    for (email, organization, user_type, pin) in [
        ("stores@cityhospital.in", "City Hospital", "hospital", "560001"),
        ("orders@greenpharmacy.in", "Green Pharmacy", "pharmacy", "560034"),
    ] {
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(registration(email, organization, user_type, pin)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["user"]["id"].as_str().unwrap().to_string();
        let (status, _) = send(&app, "POST", &format!("/api/admin/users/{}/approve", id), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = login(&app, email).await;
        tokens.push(body["token"].as_str().unwrap().to_string());
    }
    let (seller, buyer) = (tokens[0].as_str(), tokens[1].as_str());

    let expiry = (Utc::now().date_naive() + Duration::days(365)).to_string();
    let (status, listing) = send(
        &app,
        "POST",
        "/api/medicines",
        Some(seller),
        Some(json!({
            "name": "Paracetamol",
            "company": "Cipla",
            "dosage": "500mg",
            "expiryDate": expiry,
            "batchNumber": "B-1001",
            "quantity": 10,
            "costPerUnit": 25.5,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(listing["status"], "pending");
    let medicine_id = listing["id"].as_str().unwrap().to_string();

    let (status, results) = send(&app, "GET", "/api/medicines/search?name=para", Some(buyer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(results.as_array().unwrap().is_empty());

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/admin/medicines/{}/approve", medicine_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, results) = send(
        &app,
        "GET",
        "/api/medicines/search?name=para&pinCode=560034",
        Some(buyer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["distanceKm"], 15.0);
    assert_eq!(results[0]["senderName"], "City Hospital");

    let (status, _) = send(
        &app,
        "POST",
        "/api/cart",
        Some(seller),
        Some(json!({"medicineId": medicine_id, "quantity": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/cart",
        Some(buyer),
        Some(json!({"medicineId": medicine_id, "quantity": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        "POST",
        "/api/cart",
        Some(buyer),
        Some(json!({"medicineId": medicine_id, "quantity": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, cart) = send(&app, "GET", "/api/cart", Some(buyer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["items"].as_array().unwrap().len(), 1);
    assert_eq!(cart["subtotal"], 102.0);
    assert_eq!(cart["deliveryFee"], 50.0);
    assert_eq!(cart["total"], 152.0);

    let (status, _) = send(&app, "POST", "/api/orders", Some(buyer), Some(json!({"deliveryAddress": "short"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, order) = send(
        &app,
        "POST",
        "/api/orders",
        Some(buyer),
        Some(json!({"deliveryAddress": "12 MG Road, Bangalore 560034"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["totalAmount"], 152.0);
    assert_eq!(order["paymentStatus"], "pending");
    assert_eq!(order["items"].as_array().unwrap().len(), 1);
    let order_id = order["id"].as_str().unwrap().to_string();

    let (_, medicine) = send(&app, "GET", &format!("/api/medicines/{}", medicine_id), Some(buyer), None).await;
    assert_eq!(medicine["quantity"], 6);

    let (_, cart) = send(&app, "GET", "/api/cart", Some(buyer), None).await;
    assert!(cart["items"].as_array().unwrap().is_empty());

    let (status, sales) = send(&app, "GET", "/api/orders/sales", Some(seller), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sales.as_array().unwrap().len(), 1);
    assert_eq!(sales[0]["buyerName"], "Green Pharmacy");

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/orders/{}/delivery", order_id),
        Some(seller),
        Some(json!({"status": "in_transit"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, paid) = send(&app, "POST", &format!("/api/orders/{}/pay", order_id), Some(buyer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["paymentStatus"], "paid");
    assert!(paid["paymentId"].as_str().unwrap().starts_with("test_"));

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/orders/{}/delivery", order_id),
        Some(buyer),
        Some(json!({"status": "in_transit"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, shipped) = send(
        &app,
        "POST",
        &format!("/api/orders/{}/delivery", order_id),
        Some(seller),
        Some(json!({"status": "in_transit"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shipped["deliveryStatus"], "in_transit");

    let (status, _) = send(&app, "POST", &format!("/api/orders/{}/cancel", order_id), Some(buyer), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, stats) = send(&app, "GET", "/api/admin/stats", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalUsers"], 2);
    assert_eq!(stats["totalOrders"], 1);
    assert_eq!(stats["paidRevenue"], 152.0);

    let (status, refunded) = send(
        &app,
        "POST",
        &format!("/api/admin/orders/{}/refund", order_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refunded["paymentStatus"], "refunded");
}

#[tokio::test]
async fn test_checkout_is_all_or_nothing() -> Result<()> {
    let (db, _dir) = setup_test_db().await?;

    let seller = db.create_user(&new_user("seller@a.in", "400001"), "hash", None).await?;
    let first = db.create_user(&new_user("first@b.in", "400002"), "hash", None).await?;
    let second = db.create_user(&new_user("second@c.in", "400003"), "hash", None).await?;
    for id in [seller.id, first.id, second.id] {
        db.approve_user(id).await?;
    }

    let insulin = db.create_medicine(seller.id, &new_medicine("Insulin", 5, 120.0), None, None).await?;
    let saline = db.create_medicine(seller.id, &new_medicine("Saline", 20, 30.0), None, None).await?;
    db.approve_medicine(insulin.id, "admin").await?;
    db.approve_medicine(saline.id, "admin").await?;

    for buyer in [first.id, second.id] {
        db.add_to_cart(buyer, &AddToCart { medicine_id: saline.id, quantity: 2 }).await?;
        db.add_to_cart(buyer, &AddToCart { medicine_id: insulin.id, quantity: 5 }).await?;
    }

    let detail = db.checkout(first.id, "1 Marine Drive, Mumbai", 50.0).await?;
    assert_eq!(detail.order.subtotal, 660.0);
    assert_eq!(detail.order.total_amount, 710.0);

    let err = db.checkout(second.id, "2 Marine Drive, Mumbai", 50.0).await.unwrap_err();
    assert!(matches!(err, MarketError::InsufficientStock { available: 0, .. }));

    // The failed checkout left the second buyer's cart and the saline stock untouched.
    assert_eq!(db.list_cart(second.id).await?.len(), 2);
    assert_eq!(db.get_medicine(saline.id).await?.unwrap().medicine.quantity, 18);

    let cancelled = db.cancel_order(first.id, detail.order.id).await?;
    assert_eq!(cancelled.delivery_status, DeliveryStatus::Cancelled);
    assert_eq!(db.get_medicine(insulin.id).await?.unwrap().medicine.quantity, 5);
    assert_eq!(db.get_medicine(saline.id).await?.unwrap().medicine.quantity, 20);

    let err = db
        .update_order_payment(detail.order.id, Some("test_x"), PaymentStatus::Paid)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidTransition(_)));

    db.clear_cart(second.id).await?;
    assert!(db.list_cart(second.id).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_search_ranks_by_distance() -> Result<()> {
    let (db, _dir) = setup_test_db().await?;

    let near = db.create_user(&new_user("near@a.in", "560002"), "hash", None).await?;
    let far = db.create_user(&new_user("far@b.in", "110001"), "hash", None).await?;

    let mut soon = new_medicine("Amoxicillin", 10, 5.0);
    soon.expiry_date = Utc::now().date_naive() + Duration::days(60);
    let far_listing = db.create_medicine(far.id, &soon, None, None).await?;
    let near_listing = db.create_medicine(near.id, &new_medicine("Amoxicillin", 10, 5.0), None, None).await?;
    let hidden = db.create_medicine(near.id, &new_medicine("Amoxicillin", 10, 5.0), None, None).await?;
    db.approve_medicine(far_listing.id, "admin").await?;
    db.approve_medicine(near_listing.id, "admin").await?;
    db.reject_medicine(hidden.id).await?;

    let by_expiry = db
        .search_medicines(&medcycle::model::SearchFilters {
            name: Some("amox".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_expiry.len(), 2);
    assert_eq!(by_expiry[0].medicine.id, far_listing.id);

    let by_distance = db
        .search_medicines(&medcycle::model::SearchFilters {
            name: Some("amox".to_string()),
            pin_code: Some("560001".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_distance[0].medicine.id, near_listing.id);
    assert_eq!(by_distance[0].distance_km, Some(3.5));
    assert_eq!(by_distance[1].distance_km, Some(350.0));

    let nearby_only = db
        .search_medicines(&medcycle::model::SearchFilters {
            pin_code: Some("560001".to_string()),
            max_distance_km: Some(50.0),
            ..Default::default()
        })
        .await?;
    assert_eq!(nearby_only.len(), 1);

    let wildcard = db
        .search_medicines(&medcycle::model::SearchFilters {
            name: Some("%".to_string()),
            dosage: Some("_".to_string()),
            ..Default::default()
        })
        .await?;
    assert!(wildcard.is_empty());

    let long_dated = db
        .search_medicines(&medcycle::model::SearchFilters {
            min_expiry_months: Some(6),
            ..Default::default()
        })
        .await?;
    assert_eq!(long_dated.len(), 1);
    assert_eq!(long_dated[0].medicine.id, near_listing.id);

    Ok(())
}

#[tokio::test]
async fn test_stripe_webhook_marks_order_paid() -> Result<()> {
    let app = setup_test_app().await;
    let db = &app.db;

    let seller = db.create_user(&new_user("seller@a.in", "400001"), "hash", None).await?;
    let buyer = db.create_user(&new_user("buyer@b.in", "400050"), "hash", None).await?;
    let listing = db.create_medicine(seller.id, &new_medicine("Cetirizine", 30, 3.0), None, None).await?;
    db.approve_medicine(listing.id, "admin").await?;
    db.add_to_cart(buyer.id, &AddToCart { medicine_id: listing.id, quantity: 10 }).await?;
    let detail = db.checkout(buyer.id, "5 Linking Road, Mumbai", 50.0).await?;

    let payload = json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": "pi_123",
            "amount": 8000,
            "currency": "inr",
            "status": "succeeded",
            "metadata": { "order_id": detail.order.id.to_string() }
        }}
    })
    .to_string();

    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let signature = format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()));

    let forged = Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("stripe-signature", format!("t={},v1=00ff", timestamp))
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = app.router.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("stripe-signature", signature)
        .body(Body::from(payload))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let order = db.get_order(detail.order.id).await?.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.payment_id.as_deref(), Some("pi_123"));
    assert_eq!(db.find_order_by_payment_id("pi_123").await?.unwrap().id, order.id);

    Ok(())
}

#[tokio::test]
async fn test_cart_orders_and_listings_check_ownership() {
    let app = setup_test_app().await;
    let admin = admin_token(&app).await;
    let (_, seller) = approved_member(&app, &admin, "stock@northpharma.in", "North Pharmacy", "110001").await;
    let (_, buyer) = approved_member(&app, &admin, "buy@southpharma.in", "South Pharmacy", "110002").await;
    let (_, stranger) = approved_member(&app, &admin, "ops@eastpharma.in", "East Pharmacy", "110003").await;

    let expiry = (Utc::now().date_naive() + Duration::days(365)).to_string();
    let (status, listing) = send(
        &app,
        "POST",
        "/api/medicines",
        Some(&seller),
        Some(json!({
            "name": "Metformin",
            "company": "Sun Pharma",
            "dosage": "500mg",
            "expiryDate": expiry,
            "batchNumber": "MF-9",
            "quantity": 10,
            "costPerUnit": 4.0,
            "imageBase64": format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(PNG_BYTES)),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let medicine_id = listing["id"].as_str().unwrap().to_string();

    let verification = &listing["verification"];
    assert_eq!(verification["verdict"], "manual_review");
    assert!(verification["reasons"]
        .as_array()
        .unwrap()
        .iter()
        .any(|reason| reason == "label could not be read automatically"));

    let image_url = listing["imageUrl"].as_str().unwrap().to_string();
    let file_name = image_url.strip_prefix("/uploads/").unwrap();
    assert_eq!(std::fs::read(app.upload_dir.join(file_name)).unwrap(), PNG_BYTES);

    let request = Request::builder().uri(&image_url).body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let served = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&served[..], PNG_BYTES);

    // Unapproved listings are hidden from everyone but their sender and admins.
    let listing_uri = format!("/api/medicines/{}", medicine_id);
    let (status, _) = send(&app, "GET", &listing_uri, Some(&buyer), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &listing_uri, Some(&seller), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", &listing_uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/admin/medicines/{}/approve", medicine_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", &listing_uri, Some(&buyer), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, item) = send(
        &app,
        "POST",
        "/api/cart",
        Some(&buyer),
        Some(json!({"medicineId": medicine_id, "quantity": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let item_uri = format!("/api/cart/{}", item["id"].as_str().unwrap());

    let (status, _) = send(&app, "PUT", &item_uri, Some(&stranger), Some(json!({"quantity": 1}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "PUT", &item_uri, Some(&stranger), Some(json!({"quantity": 0}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "DELETE", &item_uri, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "PUT", &item_uri, Some(&buyer), Some(json!({"quantity": 11}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, body) = send(&app, "PUT", &item_uri, Some(&buyer), Some(json!({"quantity": 3}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["item"]["quantity"], 3);

    let (status, order) = send(
        &app,
        "POST",
        "/api/orders",
        Some(&buyer),
        Some(json!({"deliveryAddress": "44 Chandni Chowk, Delhi 110006"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["items"][0]["quantity"], 3);
    let order_uri = format!("/api/orders/{}", order["id"].as_str().unwrap());

    let (status, _) = send(&app, "GET", &order_uri, Some(&stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, "GET", &order_uri, Some(&seller), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", &order_uri, Some(&buyer), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, item) = send(
        &app,
        "POST",
        "/api/cart",
        Some(&buyer),
        Some(json!({"medicineId": medicine_id, "quantity": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(
        &app,
        "PUT",
        &format!("/api/cart/{}", item["id"].as_str().unwrap()),
        Some(&buyer),
        Some(json!({"quantity": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("item").is_none());
    let (_, cart) = send(&app, "GET", "/api/cart", Some(&buyer), None).await;
    assert!(cart["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_with_card_payment_in_flight() -> Result<()> {
    let (stripe_base, stripe) = spawn_stub_stripe().await;
    let app = setup_test_app_with(|config| {
        config.payments.stripe_secret_key = Some("sk_test_stub".to_string());
        config.payments.stripe_api_base = stripe_base;
    })
    .await;
    let db = &app.db;
    let admin = admin_token(&app).await;
    let (buyer_id, buyer) = approved_member(&app, &admin, "buy@westpharma.in", "West Pharmacy", "400050").await;
    let buyer_id = uuid::Uuid::parse_str(&buyer_id).unwrap();

    let seller = db.create_user(&new_user("seller@a.in", "400001"), "hash", None).await?;
    let listing = db.create_medicine(seller.id, &new_medicine("Cetirizine", 30, 3.0), None, None).await?;
    db.approve_medicine(listing.id, "admin").await?;

    db.add_to_cart(buyer_id, &AddToCart { medicine_id: listing.id, quantity: 10 }).await?;
    let order = db.checkout(buyer_id, "5 Linking Road, Mumbai", 50.0).await?.order;
    db.attach_payment_id(order.id, "pi_live_1").await?;

    // The stock stays reserved while the intent can still be charged.
    let err = db.cancel_order(buyer_id, order.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidTransition(_)));
    assert_eq!(db.get_medicine(listing.id).await?.unwrap().medicine.quantity, 20);

    let (status, cancelled) = send(&app, "POST", &format!("/api/orders/{}/cancel", order.id), Some(&buyer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["deliveryStatus"], "cancelled");
    assert!(cancelled["paymentId"].is_null());
    assert_eq!(stripe.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(db.get_medicine(listing.id).await?.unwrap().medicine.quantity, 30);

    // A charge that still lands on the cancelled order is refunded, once.
    let event = succeeded_event("evt_late", "pi_late_2", &order.id.to_string());
    for _ in 0..2 {
        let response = app.router.clone().oneshot(signed_webhook(&event)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(stripe.refunds.load(Ordering::SeqCst), 1);

    let order = db.get_order(order.id).await?.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(order.delivery_status, DeliveryStatus::Cancelled);
    assert_eq!(order.payment_id.as_deref(), Some("pi_late_2"));
    assert_eq!(db.get_medicine(listing.id).await?.unwrap().medicine.quantity, 30);

    Ok(())
}

#[tokio::test]
async fn test_payment_writes_respect_cancellation() -> Result<()> {
    let (db, _dir) = setup_test_db().await?;

    let seller = db.create_user(&new_user("seller@a.in", "600001"), "hash", None).await?;
    let buyer = db.create_user(&new_user("buyer@b.in", "600002"), "hash", None).await?;
    let listing = db.create_medicine(seller.id, &new_medicine("Azithromycin", 8, 12.0), None, None).await?;
    db.approve_medicine(listing.id, "admin").await?;
    db.add_to_cart(buyer.id, &AddToCart { medicine_id: listing.id, quantity: 8 }).await?;
    let order = db.checkout(buyer.id, "9 Anna Salai, Chennai", 50.0).await?.order;

    db.cancel_order(buyer.id, order.id).await?;

    let err = db
        .update_order_payment(order.id, Some("pi_9"), PaymentStatus::Failed)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidTransition(_)));
    let err = db.attach_payment_id(order.id, "pi_9").await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidTransition(_)));
    let err = db
        .update_order_delivery(order.id, DeliveryStatus::Delivered)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidTransition(_)));

    let order = db.get_order(order.id).await?.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.payment_id, None);
    assert_eq!(order.delivery_status, DeliveryStatus::Cancelled);

    Ok(())
}
