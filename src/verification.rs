//! Advisory checks attached to registrations and listings.
//!
//! The chat model is only used to read package labels and to give an opinion on
//! registration details. Comparing what was read against the listing is done locally.
//! Nothing here approves a record: the verdict is stored for the admin who decides.

use crate::{
    config::{LLMConfig, MarketplaceConfig},
    error::{MarketError, Result},
    geo,
    model::{is_valid_aadhaar, is_valid_email, normalize_mobile, NewMedicine, NewUser, UserType},
};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs, ResponseFormat,
    },
    Client,
};
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OCR_PROMPT: &str = "You read medicine package labels. Reply with a JSON object with the keys \
name, company, expiryDate, batchNumber, dosage, confidence (0 to 1) and extractedText. \
Copy text exactly as printed and use an empty string for anything you cannot read.";

const REGISTRATION_PROMPT: &str = "You screen healthcare organizations registering on a medicine \
redistribution marketplace. Reply with a JSON object with the keys plausible (boolean), \
confidence (0 to 1) and notes (string). Judge only whether the details look like a real \
organization of the stated type.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Consistent,
    Mismatch,
    ManualReview,
}

/// Fields read from a package photo.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OcrExtraction {
    pub name: String,
    pub company: String,
    pub expiry_date: String,
    pub batch_number: String,
    pub dosage: String,
    pub confidence: f64,
    pub extracted_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicineVerification {
    pub verdict: Verdict,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub extraction: Option<OcrExtraction>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelOpinion {
    pub plausible: bool,
    pub confidence: f64,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReport {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub model_opinion: Option<ModelOpinion>,
    pub checked_at: DateTime<Utc>,
}

pub struct VerificationService {
    client: Option<Client<OpenAIConfig>>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    min_expiry_months: u32,
}

impl VerificationService {
    pub fn new(llm: &LLMConfig, marketplace: &MarketplaceConfig) -> Self {
        let client = llm.api_key.as_deref().filter(|key| !key.is_empty()).map(|key| {
            let mut config = OpenAIConfig::new().with_api_key(key);
            if let Some(base) = llm.api_base.as_deref() {
                config = config.with_api_base(base);
            }
            Client::with_config(config)
        });

        if client.is_none() {
            tracing::warn!("no model API key configured; verification reports will ask for manual review");
        }

        Self {
            client,
            model: llm.model.clone(),
            max_tokens: llm.max_tokens,
            timeout: Duration::from_secs(llm.timeout_seconds),
            min_expiry_months: marketplace.min_expiry_months,
        }
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    async fn complete_json(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| MarketError::Model("model is not configured".to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(self.max_tokens)
            .response_format(ResponseFormat::JsonObject)
            .messages(messages)
            .build()?;

        let response = tokio::time::timeout(self.timeout, client.chat().create(request))
            .await
            .map_err(|_| MarketError::Model("model request timed out".to_string()))??;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| MarketError::Model("model returned no content".to_string()))
    }

    /// Reads the label on a package photo.
    pub async fn extract_label(&self, image: &[u8], mime_type: &str) -> Result<OcrExtraction> {
        let data_url = format!("data:{};base64,{}", mime_type, general_purpose::STANDARD.encode(image));

        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(OCR_PROMPT)
            .build()?;
        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text("Extract the label fields from this medicine package.")
                .build()?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(ImageUrlArgs::default().url(data_url).detail(ImageDetail::High).build()?)
                .build()?
                .into(),
        ];
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(parts)
            .build()?;

        let content = self.complete_json(vec![system.into(), user.into()]).await?;
        parse_extraction(&content)
    }

    /// Builds the report stored with a new listing. Never fails: problems with the
    /// model become a manual-review verdict.
    pub async fn verify_listing(&self, listing: &NewMedicine, image: Option<(&[u8], &str)>) -> MedicineVerification {
        let today = Utc::now().date_naive();

        let extraction = match image {
            Some((bytes, mime)) if self.is_available() => match self.extract_label(bytes, mime).await {
                Ok(extraction) => Some(extraction),
                Err(e) => {
                    tracing::warn!(error = %e, "label extraction failed");
                    None
                }
            },
            _ => None,
        };

        let mut report = compare_listing(listing, extraction.as_ref(), today, self.min_expiry_months);
        if image.is_some() && extraction.is_none() {
            report.reasons.push("label could not be read automatically".to_string());
        }
        tracing::info!(medicine = %listing.name, verdict = ?report.verdict, "listing checked");
        report
    }

    pub async fn verify_registration(&self, user: &NewUser) -> RegistrationReport {
        let mut reasons = registration_findings(user);
        let has_findings = !reasons.is_empty();

        let opinion = if self.is_available() {
            match self.registration_opinion(user).await {
                Ok(opinion) => Some(opinion),
                Err(e) => {
                    tracing::warn!(error = %e, "registration opinion failed");
                    None
                }
            }
        } else {
            None
        };

        let verdict = match &opinion {
            _ if has_findings => Verdict::Mismatch,
            Some(opinion) if opinion.plausible => Verdict::Consistent,
            Some(opinion) => {
                reasons.push(format!("model doubts the registration: {}", opinion.notes));
                Verdict::ManualReview
            }
            None => {
                reasons.push("automatic screening unavailable".to_string());
                Verdict::ManualReview
            }
        };

        RegistrationReport {
            verdict,
            reasons,
            model_opinion: opinion,
            checked_at: Utc::now(),
        }
    }

    async fn registration_opinion(&self, user: &NewUser) -> Result<ModelOpinion> {
        let location = geo::locate(&user.pin_code)
            .map(|l| format!("{}, {}", l.city, l.state))
            .unwrap_or_else(|| "unknown".to_string());
        let details = serde_json::json!({
            "organizationName": user.organization_name,
            "ownerName": user.owner_name,
            "userType": user.user_type.as_str(),
            "pinCode": user.pin_code,
            "location": location,
            "email": user.email,
            "hasGovernmentId": user.gov_id_number.is_some(),
        });

        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(REGISTRATION_PROMPT)
            .build()?;
        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(details.to_string())
            .build()?;

        let content = self
            .complete_json(vec![system.into(), user_message.into()])
            .await?;
        let mut opinion: ModelOpinion = serde_json::from_str(&content)
            .map_err(|e| MarketError::Model(format!("unreadable registration opinion: {}", e)))?;
        opinion.confidence = opinion.confidence.clamp(0.0, 1.0);
        Ok(opinion)
    }
}

pub fn parse_extraction(content: &str) -> Result<OcrExtraction> {
    let mut extraction: OcrExtraction = serde_json::from_str(content)
        .map_err(|e| MarketError::Model(format!("unreadable label extraction: {}", e)))?;
    extraction.confidence = extraction.confidence.clamp(0.0, 1.0);
    Ok(extraction)
}

/// Lowercase alphanumerics only, so "Para-cetamol 500" and "PARACETAMOL500" compare equal.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn names_match(listed: &str, read: &str) -> bool {
    let listed = normalize(listed);
    let read = normalize(read);
    !listed.is_empty() && !read.is_empty() && (listed.contains(&read) || read.contains(&listed))
}

const FULL_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%y"];
const MONTH_FORMATS: &[&str] = &["%m/%Y", "%m-%Y", "%m.%Y", "%b %Y", "%B %Y", "%b-%Y", "%b.%Y", "%m/%y", "%m-%y", "%b %y", "%b-%y"];

/// Year and month of an expiry date as printed on a label.
pub fn parse_label_expiry(text: &str) -> Option<(i32, u32)> {
    let lowered = text.trim().to_lowercase();
    let mut cleaned = lowered.as_str();
    for prefix in ["expiry date", "expiry", "exp. date", "exp date", "exp.", "exp", "use before", "best before"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest;
            break;
        }
    }
    let cleaned = cleaned.trim_start_matches([':', '.', ' ', '-']).trim();
    if cleaned.is_empty() {
        return None;
    }

    let plausible = |date: NaiveDate| (2000..=2100).contains(&date.year());

    for format in FULL_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            if plausible(date) {
                return Some((date.year(), date.month()));
            }
        }
    }

    let with_day = format!("01 {}", cleaned);
    for format in MONTH_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&with_day, &format!("%d {}", format)) {
            if plausible(date) {
                return Some((date.year(), date.month()));
            }
        }
    }

    None
}

/// Compares a listing with what was read from its package.
pub fn compare_listing(
    listing: &NewMedicine,
    extraction: Option<&OcrExtraction>,
    today: NaiveDate,
    min_expiry_months: u32,
) -> MedicineVerification {
    let mut reasons = Vec::new();
    let mut needs_review = false;

    let earliest = today
        .checked_add_months(Months::new(min_expiry_months))
        .unwrap_or(today);
    if listing.expiry_date < earliest {
        reasons.push(format!("expires within {} months", min_expiry_months));
        needs_review = true;
    }
    if !listing.is_sealed {
        reasons.push("package is not sealed".to_string());
        needs_review = true;
    }

    let Some(read) = extraction else {
        reasons.push("no package label was analysed".to_string());
        return MedicineVerification {
            verdict: Verdict::ManualReview,
            confidence: 0.0,
            reasons,
            extraction: None,
            checked_at: Utc::now(),
        };
    };

    let mut mismatched = false;
    let mut checked = 0u32;
    let mut matched = 0u32;
    let mut compare = |field: &str, listed: &str, read: &str, exact: bool| {
        if normalize(read).is_empty() {
            reasons.push(format!("{} not readable on label", field));
            needs_review = true;
            return;
        }
        checked += 1;
        let ok = if exact {
            normalize(listed) == normalize(read)
        } else {
            names_match(listed, read)
        };
        if ok {
            matched += 1;
        } else {
            reasons.push(format!("{} differs: listed '{}', label '{}'", field, listed.trim(), read.trim()));
            mismatched = true;
        }
    };

    compare("name", &listing.name, &read.name, false);
    compare("company", &listing.company, &read.company, false);
    compare("batch number", &listing.batch_number, &read.batch_number, true);

    match parse_label_expiry(&read.expiry_date) {
        Some((year, month)) => {
            checked += 1;
            if (year, month) == (listing.expiry_date.year(), listing.expiry_date.month()) {
                matched += 1;
            } else {
                reasons.push(format!(
                    "expiry differs: listed {}, label {:02}/{}",
                    listing.expiry_date.format("%m/%Y"),
                    month,
                    year
                ));
                mismatched = true;
            }
        }
        None => {
            reasons.push("expiry date not readable on label".to_string());
            needs_review = true;
        }
    }

    let confidence = if checked == 0 {
        0.0
    } else {
        (matched as f64 / checked as f64) * read.confidence.clamp(0.0, 1.0)
    };

    let verdict = if mismatched {
        Verdict::Mismatch
    } else if needs_review {
        Verdict::ManualReview
    } else {
        Verdict::Consistent
    };

    MedicineVerification {
        verdict,
        confidence: (confidence * 100.0).round() / 100.0,
        reasons,
        extraction: Some(read.clone()),
        checked_at: Utc::now(),
    }
}

/// Format problems in a registration that an admin should see.
pub fn registration_findings(user: &NewUser) -> Vec<String> {
    let mut findings = Vec::new();

    if !is_valid_email(&user.email) {
        findings.push("email address is malformed".to_string());
    }
    if normalize_mobile(&user.mobile).is_none() {
        findings.push("mobile number is not a valid Indian number".to_string());
    }
    if !geo::is_valid_pin(&user.pin_code) {
        findings.push("PIN code is invalid".to_string());
    }
    if let Some(aadhaar) = user.aadhaar_number.as_deref() {
        if !is_valid_aadhaar(aadhaar) {
            findings.push("Aadhaar number is invalid".to_string());
        }
    }
    if matches!(user.user_type, UserType::Hospital | UserType::Pharmacy)
        && user.gov_id_number.as_deref().map_or(true, |id| id.trim().is_empty())
    {
        findings.push(format!("government registration id missing for a {}", user.user_type.as_str()));
    }

    let organization = user.organization_name.to_lowercase();
    if !user
        .user_type
        .name_keywords()
        .iter()
        .any(|keyword| organization.contains(keyword))
    {
        findings.push(format!(
            "organization name does not suggest a {}",
            user.user_type.as_str().replace('_', " ")
        ));
    }

    findings
}
