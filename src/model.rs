use crate::{geo, MarketError, MedicineId, OrderId, Result, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Rounds a money amount to two decimal places.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Hospital,
    Pharmacy,
    MedicalShop,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Hospital => "hospital",
            UserType::Pharmacy => "pharmacy",
            UserType::MedicalShop => "medical_shop",
        }
    }

    /// Words an organization name of this type usually contains.
    pub fn name_keywords(&self) -> &'static [&'static str] {
        match self {
            UserType::Hospital => &["hospital", "clinic", "medical", "health", "care", "nursing", "institute"],
            UserType::Pharmacy => &["pharmacy", "pharma", "chemist", "drug", "medical", "medicos"],
            UserType::MedicalShop => &["medical", "store", "shop", "chemist", "drug", "pharmacy", "medicos"],
        }
    }
}

impl FromStr for UserType {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hospital" => Ok(UserType::Hospital),
            "pharmacy" => Ok(UserType::Pharmacy),
            "medical_shop" => Ok(UserType::MedicalShop),
            other => Err(MarketError::Validation(format!("Invalid user type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pending,
    SenderReceiver,
    Rejected,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "pending",
            Role::SenderReceiver => "sender_receiver",
            Role::Rejected => "rejected",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Role::Pending),
            "sender_receiver" => Ok(Role::SenderReceiver),
            "rejected" => Ok(Role::Rejected),
            "admin" => Ok(Role::Admin),
            other => Err(MarketError::Validation(format!("Invalid role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub organization_name: String,
    pub owner_name: String,
    pub mobile: String,
    pub pin_code: String,
    pub user_type: UserType,
    pub gov_id_number: Option<String>,
    pub aadhaar_number: Option<String>,
    pub is_verified: bool,
    pub role: Role,
    pub verification: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub organization_name: String,
    pub owner_name: String,
    pub mobile: String,
    pub pin_code: String,
    pub user_type: UserType,
    #[serde(default)]
    pub gov_id_number: Option<String>,
    #[serde(default)]
    pub aadhaar_number: Option<String>,
}

impl NewUser {
    pub const MIN_PASSWORD_LEN: usize = 8;

    pub fn validate(&self) -> Result<()> {
        if !is_valid_email(&self.email) {
            return Err(MarketError::Validation("Invalid email address".to_string()));
        }
        if self.password.chars().count() < Self::MIN_PASSWORD_LEN {
            return Err(MarketError::Validation(format!(
                "Password must be at least {} characters",
                Self::MIN_PASSWORD_LEN
            )));
        }
        if self.organization_name.trim().is_empty() {
            return Err(MarketError::Validation("Organization name is required".to_string()));
        }
        if self.owner_name.trim().is_empty() {
            return Err(MarketError::Validation("Owner name is required".to_string()));
        }
        if normalize_mobile(&self.mobile).is_none() {
            return Err(MarketError::Validation("Invalid mobile number".to_string()));
        }
        if !geo::is_valid_pin(&self.pin_code) {
            return Err(MarketError::Validation("Invalid PIN code".to_string()));
        }
        if let Some(aadhaar) = self.aadhaar_number.as_deref().filter(|a| !a.trim().is_empty()) {
            if !is_valid_aadhaar(aadhaar) {
                return Err(MarketError::Validation("Aadhaar number must be 12 digits".to_string()));
            }
        }
        Ok(())
    }

    /// Trims free-text fields and canonicalizes email, mobile and Aadhaar.
    pub fn normalized(mut self) -> Self {
        self.email = self.email.trim().to_lowercase();
        self.organization_name = self.organization_name.trim().to_string();
        self.owner_name = self.owner_name.trim().to_string();
        self.pin_code = self.pin_code.trim().to_string();
        if let Some(mobile) = normalize_mobile(&self.mobile) {
            self.mobile = mobile;
        }
        self.gov_id_number = self
            .gov_id_number
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());
        self.aadhaar_number = self
            .aadhaar_number
            .map(|a| a.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|a| !a.is_empty());
        self
    }
}

pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.contains(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Returns the 10-digit Indian mobile number, accepting `+91`, `91` and `0` prefixes.
pub fn normalize_mobile(mobile: &str) -> Option<String> {
    let digits: String = mobile
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let local = match digits.len() {
        10 => digits,
        11 if digits.starts_with('0') => &digits[1..],
        12 if digits.starts_with("91") => &digits[2..],
        _ => return None,
    };
    match local.chars().next() {
        Some('6'..='9') => Some(local.to_string()),
        _ => None,
    }
}

pub fn is_valid_aadhaar(aadhaar: &str) -> bool {
    let digits: String = aadhaar.chars().filter(|c| !c.is_whitespace()).collect();
    digits.len() == 12
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
        && !digits.starts_with('1')
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Pending,
    Approved,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Pending => "pending",
            ListingStatus::Approved => "approved",
            ListingStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ListingStatus::Pending),
            "approved" => Ok(ListingStatus::Approved),
            "rejected" => Ok(ListingStatus::Rejected),
            other => Err(MarketError::Validation(format!("Invalid listing status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Medicine {
    pub id: MedicineId,
    pub sender_id: UserId,
    pub name: String,
    pub company: String,
    pub dosage: Option<String>,
    pub expiry_date: NaiveDate,
    pub batch_number: String,
    pub quantity: i64,
    pub cost_per_unit: f64,
    pub image_url: Option<String>,
    pub is_sealed: bool,
    pub status: ListingStatus,
    pub approved_by: Option<String>,
    pub verification: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Medicine {
    pub fn is_approved(&self) -> bool {
        self.status == ListingStatus::Approved
    }
}

/// A listing joined with its sender, as shown to buyers and admins.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicineView {
    #[serde(flatten)]
    pub medicine: Medicine,
    pub sender_name: String,
    pub sender_pin_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMedicine {
    pub name: String,
    pub company: String,
    #[serde(default)]
    pub dosage: Option<String>,
    pub expiry_date: NaiveDate,
    pub batch_number: String,
    pub quantity: i64,
    pub cost_per_unit: f64,
    #[serde(default = "default_sealed")]
    pub is_sealed: bool,
    /// Package photo, base64 encoded (optionally as a `data:` URL).
    #[serde(default)]
    pub image_base64: Option<String>,
}

fn default_sealed() -> bool {
    true
}

impl NewMedicine {
    pub fn validate(&self, today: NaiveDate) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MarketError::Validation("Medicine name is required".to_string()));
        }
        if self.company.trim().is_empty() {
            return Err(MarketError::Validation("Company is required".to_string()));
        }
        if self.batch_number.trim().is_empty() {
            return Err(MarketError::Validation("Batch number is required".to_string()));
        }
        if self.quantity <= 0 {
            return Err(MarketError::Validation("Quantity must be greater than 0".to_string()));
        }
        if !(self.cost_per_unit > 0.0 && self.cost_per_unit.is_finite()) {
            return Err(MarketError::Validation("Cost per unit must be greater than 0".to_string()));
        }
        if self.expiry_date <= today {
            return Err(MarketError::Validation("Expired medicines cannot be listed".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: Uuid,
    pub user_id: UserId,
    pub medicine_id: MedicineId,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

/// A cart row joined with the listing it refers to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub id: Uuid,
    pub medicine_id: MedicineId,
    pub quantity: i64,
    pub medicine_name: String,
    pub medicine_company: String,
    pub unit_price: f64,
    pub sender_id: UserId,
    pub sender_name: String,
    pub available_quantity: i64,
    pub line_total: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToCart {
    pub medicine_id: MedicineId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCartItem {
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Failed) | (Failed, Paid) | (Failed, Failed) | (Paid, Refunded)
        )
    }
}

impl FromStr for PaymentStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(MarketError::Validation(format!("Invalid payment status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InTransit,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, InTransit) | (Pending, Cancelled) | (InTransit, Delivered)
        )
    }
}

impl FromStr for DeliveryStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "in_transit" => Ok(DeliveryStatus::InTransit),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "cancelled" => Ok(DeliveryStatus::Cancelled),
            other => Err(MarketError::Validation(format!("Invalid delivery status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub buyer_id: UserId,
    pub subtotal: f64,
    pub delivery_fee: f64,
    pub total_amount: f64,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<String>,
    pub delivery_status: DeliveryStatus,
    pub delivery_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Payment can be started while nothing has been collected and the order is still live.
    pub fn is_payable(&self) -> bool {
        matches!(self.payment_status, PaymentStatus::Pending | PaymentStatus::Failed)
            && self.delivery_status != DeliveryStatus::Cancelled
    }

    /// A provider intent is attached that may still be charged.
    pub fn open_intent(&self) -> Option<&str> {
        if !matches!(self.payment_status, PaymentStatus::Pending | PaymentStatus::Failed) {
            return None;
        }
        self.payment_id
            .as_deref()
            .filter(|id| !crate::payments::is_test_payment(id))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: OrderId,
    pub medicine_id: MedicineId,
    pub medicine_name: String,
    pub sender_id: UserId,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_price: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

impl OrderDetail {
    pub fn involves_sender(&self, sender_id: UserId) -> bool {
        self.items.iter().any(|item| item.sender_id == sender_id)
    }
}

/// One line of an order as seen by the sender who supplied it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    #[serde(flatten)]
    pub item: OrderItem,
    pub buyer_name: String,
    pub buyer_pin_code: String,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub delivery_address: String,
    pub ordered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub delivery_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub name: Option<String>,
    pub pin_code: Option<String>,
    pub min_expiry_months: Option<u32>,
    pub dosage: Option<String>,
    pub min_quantity: Option<i64>,
    pub max_cost: Option<f64>,
    pub max_distance_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub total_users: i64,
    pub pending_approvals: i64,
    pub total_medicines: i64,
    pub pending_medicines: i64,
    pub total_orders: i64,
    pub paid_revenue: f64,
}
