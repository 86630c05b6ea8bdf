use crate::{
    config::DatabaseConfig,
    geo,
    model::*,
    MarketError, MedicineId, OrderId, Result, UserId,
};
use chrono::{Months, NaiveDate, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const MEDICINE_VIEW_COLUMNS: &str = r#"
    m.id, m.sender_id, m.name, m.company, m.dosage, m.expiry_date, m.batch_number,
    m.quantity, m.cost_per_unit, m.image_url, m.is_sealed, m.status, m.approved_by,
    m.verification, m.created_at, m.updated_at,
    u.organization_name AS sender_name, u.pin_code AS sender_pin_code
"#;

const USER_COLUMNS: &str = r#"
    id, email, password_hash, organization_name, owner_name, mobile, pin_code, user_type,
    gov_id_number, aadhaar_number, is_verified, role, verification, created_at, updated_at
"#;

const ORDER_COLUMNS: &str = r#"
    id, buyer_id, subtotal, delivery_fee, total_amount, payment_status, payment_id,
    delivery_status, delivery_address, created_at, updated_at
"#;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::info!(url = %config.url, "database ready");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                organization_name TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                mobile TEXT NOT NULL,
                pin_code TEXT NOT NULL,
                user_type TEXT NOT NULL,
                gov_id_number TEXT,
                aadhaar_number TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                role TEXT NOT NULL DEFAULT 'pending',
                verification TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS medicines (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                name TEXT NOT NULL,
                company TEXT NOT NULL,
                dosage TEXT,
                expiry_date DATE NOT NULL,
                batch_number TEXT NOT NULL,
                quantity INTEGER NOT NULL CHECK (quantity >= 0),
                cost_per_unit REAL NOT NULL,
                image_url TEXT,
                is_sealed INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                approved_by TEXT,
                verification TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                FOREIGN KEY (sender_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS cart_items (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                medicine_id TEXT NOT NULL,
                quantity INTEGER NOT NULL CHECK (quantity > 0),
                created_at DATETIME NOT NULL,
                UNIQUE (user_id, medicine_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (medicine_id) REFERENCES medicines(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                buyer_id TEXT NOT NULL,
                subtotal REAL NOT NULL,
                delivery_fee REAL NOT NULL,
                total_amount REAL NOT NULL,
                payment_status TEXT NOT NULL DEFAULT 'pending',
                payment_id TEXT,
                delivery_status TEXT NOT NULL DEFAULT 'pending',
                delivery_address TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                FOREIGN KEY (buyer_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS order_items (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                medicine_id TEXT NOT NULL,
                medicine_name TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                unit_price REAL NOT NULL,
                total_price REAL NOT NULL,
                FOREIGN KEY (order_id) REFERENCES orders(id) ON DELETE CASCADE,
                FOREIGN KEY (medicine_id) REFERENCES medicines(id),
                FOREIGN KEY (sender_id) REFERENCES users(id)
            );

            CREATE INDEX IF NOT EXISTS idx_users_role ON users(role);
            CREATE INDEX IF NOT EXISTS idx_medicines_sender ON medicines(sender_id);
            CREATE INDEX IF NOT EXISTS idx_medicines_status_expiry ON medicines(status, expiry_date);
            CREATE INDEX IF NOT EXISTS idx_cart_user ON cart_items(user_id);
            CREATE INDEX IF NOT EXISTS idx_orders_buyer ON orders(buyer_id);
            CREATE INDEX IF NOT EXISTS idx_orders_payment ON orders(payment_id);
            CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
            CREATE INDEX IF NOT EXISTS idx_order_items_sender ON order_items(sender_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Users

    pub async fn create_user(
        &self,
        new_user: &NewUser,
        password_hash: &str,
        verification: Option<&serde_json::Value>,
    ) -> Result<User> {
        if self.get_user_by_email(&new_user.email).await?.is_some() {
            return Err(MarketError::Conflict("User already exists with this email".to_string()));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.clone(),
            password_hash: password_hash.to_string(),
            organization_name: new_user.organization_name.clone(),
            owner_name: new_user.owner_name.clone(),
            mobile: new_user.mobile.clone(),
            pin_code: new_user.pin_code.clone(),
            user_type: new_user.user_type,
            gov_id_number: new_user.gov_id_number.clone(),
            aadhaar_number: new_user.aadhaar_number.clone(),
            is_verified: false,
            role: Role::Pending,
            verification: verification.cloned(),
            created_at: now,
            updated_at: now,
        };

        let verification = user.verification.as_ref().map(serde_json::to_string).transpose()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, organization_name, owner_name, mobile, pin_code,
                               user_type, gov_id_number, aadhaar_number, is_verified, role, verification,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.organization_name)
        .bind(&user.owner_name)
        .bind(&user.mobile)
        .bind(&user.pin_code)
        .bind(user.user_type.as_str())
        .bind(&user.gov_id_number)
        .bind(&user.aadhaar_number)
        .bind(user.is_verified)
        .bind(user.role.as_str())
        .bind(verification)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(user),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(MarketError::Conflict("User already exists with this email".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS))
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn list_pending_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE role = 'pending' ORDER BY created_at DESC",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!("SELECT {} FROM users ORDER BY created_at DESC", USER_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(user_from_row).collect()
    }

    pub async fn approve_user(&self, user_id: UserId) -> Result<User> {
        self.set_user_role(user_id, Role::SenderReceiver, true).await
    }

    pub async fn reject_user(&self, user_id: UserId) -> Result<User> {
        self.set_user_role(user_id, Role::Rejected, false).await
    }

    pub async fn attach_user_verification(&self, user_id: UserId, report: &serde_json::Value) -> Result<()> {
        let result = sqlx::query("UPDATE users SET verification = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(report)?)
            .bind(Utc::now())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound("User".to_string()));
        }
        Ok(())
    }

    async fn set_user_role(&self, user_id: UserId, role: Role, is_verified: bool) -> Result<User> {
        let result = sqlx::query(
            r#"
            UPDATE users SET role = ?, is_verified = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(role.as_str())
        .bind(is_verified)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound("User".to_string()));
        }

        self.get_user(user_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("User".to_string()))
    }

    // Medicines

    pub async fn create_medicine(
        &self,
        sender_id: UserId,
        listing: &NewMedicine,
        image_url: Option<String>,
        verification: Option<serde_json::Value>,
    ) -> Result<Medicine> {
        let now = Utc::now();
        let medicine = Medicine {
            id: Uuid::new_v4(),
            sender_id,
            name: listing.name.trim().to_string(),
            company: listing.company.trim().to_string(),
            dosage: listing
                .dosage
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            expiry_date: listing.expiry_date,
            batch_number: listing.batch_number.trim().to_string(),
            quantity: listing.quantity,
            cost_per_unit: round_money(listing.cost_per_unit),
            image_url,
            is_sealed: listing.is_sealed,
            status: ListingStatus::Pending,
            approved_by: None,
            verification,
            created_at: now,
            updated_at: now,
        };

        let verification = medicine.verification.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO medicines (id, sender_id, name, company, dosage, expiry_date, batch_number, quantity,
                                   cost_per_unit, image_url, is_sealed, status, approved_by, verification,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(medicine.id.to_string())
        .bind(medicine.sender_id.to_string())
        .bind(&medicine.name)
        .bind(&medicine.company)
        .bind(&medicine.dosage)
        .bind(medicine.expiry_date)
        .bind(&medicine.batch_number)
        .bind(medicine.quantity)
        .bind(medicine.cost_per_unit)
        .bind(&medicine.image_url)
        .bind(medicine.is_sealed)
        .bind(medicine.status.as_str())
        .bind(&medicine.approved_by)
        .bind(verification)
        .bind(medicine.created_at)
        .bind(medicine.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(medicine)
    }

    pub async fn get_medicine(&self, medicine_id: MedicineId) -> Result<Option<MedicineView>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM medicines m JOIN users u ON u.id = m.sender_id WHERE m.id = ?",
            MEDICINE_VIEW_COLUMNS
        ))
        .bind(medicine_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(medicine_view_from_row).transpose()
    }

    pub async fn list_medicines_by_sender(&self, sender_id: UserId) -> Result<Vec<Medicine>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM medicines m JOIN users u ON u.id = m.sender_id WHERE m.sender_id = ? ORDER BY m.created_at DESC",
            MEDICINE_VIEW_COLUMNS
        ))
        .bind(sender_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(medicine_from_row).collect()
    }

    pub async fn list_pending_medicines(&self) -> Result<Vec<MedicineView>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM medicines m JOIN users u ON u.id = m.sender_id WHERE m.status = 'pending' ORDER BY m.created_at DESC",
            MEDICINE_VIEW_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(medicine_view_from_row).collect()
    }

    pub async fn list_medicines(&self) -> Result<Vec<MedicineView>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM medicines m JOIN users u ON u.id = m.sender_id ORDER BY m.created_at DESC",
            MEDICINE_VIEW_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(medicine_view_from_row).collect()
    }

    /// Approved, unexpired, in-stock listings matching `filters`.
    ///
    /// With a buyer PIN code the results carry a distance estimate and are ordered by it
    /// (unknown distances last); otherwise they are ordered by expiry date.
    pub async fn search_medicines(&self, filters: &SearchFilters) -> Result<Vec<MedicineView>> {
        let today = Utc::now().date_naive();
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM medicines m JOIN users u ON u.id = m.sender_id \
             WHERE m.status = 'approved' AND m.quantity > 0 AND m.expiry_date > ",
            MEDICINE_VIEW_COLUMNS
        ));
        query.push_bind(today);

        if let Some(name) = filters.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            query
                .push(" AND m.name LIKE ")
                .push_bind(contains_pattern(name))
                .push(" ESCAPE '\\'");
        }

        if let Some(dosage) = filters.dosage.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            query
                .push(" AND m.dosage LIKE ")
                .push_bind(contains_pattern(dosage))
                .push(" ESCAPE '\\'");
        }

        if let Some(months) = filters.min_expiry_months.filter(|m| *m > 0) {
            let earliest = today
                .checked_add_months(Months::new(months))
                .ok_or_else(|| MarketError::Validation("minExpiryMonths is out of range".to_string()))?;
            query.push(" AND m.expiry_date >= ").push_bind(earliest);
        }

        if let Some(min_quantity) = filters.min_quantity.filter(|q| *q > 0) {
            query.push(" AND m.quantity >= ").push_bind(min_quantity);
        }

        if let Some(max_cost) = filters.max_cost {
            query.push(" AND m.cost_per_unit <= ").push_bind(max_cost);
        }

        query.push(" ORDER BY m.expiry_date ASC, m.created_at DESC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut results = rows
            .iter()
            .map(medicine_view_from_row)
            .collect::<Result<Vec<_>>>()?;

        if let Some(pin) = filters.pin_code.as_deref().filter(|p| !p.trim().is_empty()) {
            if !geo::is_valid_pin(pin) {
                return Err(MarketError::Validation("Invalid PIN code".to_string()));
            }
            for view in &mut results {
                view.distance_km = geo::estimate_distance_km(pin, &view.sender_pin_code);
            }
            if let Some(max_distance) = filters.max_distance_km {
                results.retain(|view| view.distance_km.is_some_and(|d| d <= max_distance));
            }
            // Stable sort keeps expiry order within equal distances.
            results.sort_by(|a, b| match (a.distance_km, b.distance_km) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
        }

        Ok(results)
    }

    pub async fn approve_medicine(&self, medicine_id: MedicineId, approved_by: &str) -> Result<MedicineView> {
        self.set_listing_status(medicine_id, ListingStatus::Approved, Some(approved_by))
            .await
    }

    pub async fn reject_medicine(&self, medicine_id: MedicineId) -> Result<MedicineView> {
        self.set_listing_status(medicine_id, ListingStatus::Rejected, None).await
    }

    async fn set_listing_status(
        &self,
        medicine_id: MedicineId,
        status: ListingStatus,
        approved_by: Option<&str>,
    ) -> Result<MedicineView> {
        let result = sqlx::query(
            r#"
            UPDATE medicines SET status = ?, approved_by = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(approved_by)
        .bind(Utc::now())
        .bind(medicine_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound("Medicine".to_string()));
        }

        self.get_medicine(medicine_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Medicine".to_string()))
    }

    // Cart

    pub async fn add_to_cart(&self, user_id: UserId, request: &AddToCart) -> Result<CartItem> {
        if request.quantity <= 0 {
            return Err(MarketError::Validation("Quantity must be greater than 0".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let listing = sqlx::query(
            r#"
            SELECT sender_id, name, quantity, status, expiry_date FROM medicines WHERE id = ?
            "#,
        )
        .bind(request.medicine_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MarketError::NotFound("Medicine".to_string()))?;

        let sender_id = parse_uuid(listing.try_get("sender_id")?)?;
        let name: String = listing.try_get("name")?;
        let available: i64 = listing.try_get("quantity")?;
        let status = ListingStatus::from_str(&listing.try_get::<String, _>("status")?)?;
        let expiry: NaiveDate = listing.try_get("expiry_date")?;

        if sender_id == user_id {
            return Err(MarketError::Validation("You cannot buy your own listing".to_string()));
        }
        if status != ListingStatus::Approved || expiry <= Utc::now().date_naive() {
            return Err(MarketError::Conflict(format!("{} is not available", name)));
        }

        let existing = sqlx::query(
            r#"
            SELECT id, quantity, created_at FROM cart_items WHERE user_id = ? AND medicine_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(request.medicine_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let already_in_cart: i64 = match &existing {
            Some(row) => row.try_get("quantity")?,
            None => 0,
        };
        let wanted = already_in_cart + request.quantity;
        if wanted > available {
            return Err(MarketError::InsufficientStock {
                medicine: name,
                requested: wanted,
                available,
            });
        }

        let item = match existing {
            Some(row) => {
                let id = parse_uuid(row.try_get("id")?)?;
                sqlx::query("UPDATE cart_items SET quantity = ? WHERE id = ?")
                    .bind(wanted)
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
                CartItem {
                    id,
                    user_id,
                    medicine_id: request.medicine_id,
                    quantity: wanted,
                    created_at: row.try_get("created_at")?,
                }
            }
            None => {
                let item = CartItem {
                    id: Uuid::new_v4(),
                    user_id,
                    medicine_id: request.medicine_id,
                    quantity: wanted,
                    created_at: Utc::now(),
                };
                sqlx::query(
                    r#"
                    INSERT INTO cart_items (id, user_id, medicine_id, quantity, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(item.id.to_string())
                .bind(item.user_id.to_string())
                .bind(item.medicine_id.to_string())
                .bind(item.quantity)
                .bind(item.created_at)
                .execute(&mut *tx)
                .await?;
                item
            }
        };

        tx.commit().await?;
        Ok(item)
    }

    pub async fn list_cart(&self, user_id: UserId) -> Result<Vec<CartLine>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.medicine_id, c.quantity, c.created_at,
                   m.name AS medicine_name, m.company AS medicine_company, m.cost_per_unit,
                   m.quantity AS available_quantity, m.sender_id,
                   u.organization_name AS sender_name
            FROM cart_items c
            JOIN medicines m ON m.id = c.medicine_id
            JOIN users u ON u.id = m.sender_id
            WHERE c.user_id = ?
            ORDER BY c.created_at DESC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let quantity: i64 = row.try_get("quantity")?;
                let unit_price: f64 = row.try_get("cost_per_unit")?;
                Ok(CartLine {
                    id: parse_uuid(row.try_get("id")?)?,
                    medicine_id: parse_uuid(row.try_get("medicine_id")?)?,
                    quantity,
                    medicine_name: row.try_get("medicine_name")?,
                    medicine_company: row.try_get("medicine_company")?,
                    unit_price,
                    sender_id: parse_uuid(row.try_get("sender_id")?)?,
                    sender_name: row.try_get("sender_name")?,
                    available_quantity: row.try_get("available_quantity")?,
                    line_total: round_money(unit_price * quantity as f64),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Sets the quantity of a cart line owned by `user_id`; zero or less removes it.
    pub async fn update_cart_item(&self, user_id: UserId, item_id: Uuid, quantity: i64) -> Result<Option<CartItem>> {
        if quantity <= 0 {
            self.remove_from_cart(user_id, item_id).await?;
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT c.medicine_id, c.created_at, m.name, m.quantity AS available
            FROM cart_items c JOIN medicines m ON m.id = c.medicine_id
            WHERE c.id = ? AND c.user_id = ?
            "#,
        )
        .bind(item_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MarketError::NotFound("Cart item".to_string()))?;

        let available: i64 = row.try_get("available")?;
        if quantity > available {
            return Err(MarketError::InsufficientStock {
                medicine: row.try_get("name")?,
                requested: quantity,
                available,
            });
        }

        sqlx::query("UPDATE cart_items SET quantity = ? WHERE id = ? AND user_id = ?")
            .bind(quantity)
            .bind(item_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(Some(CartItem {
            id: item_id,
            user_id,
            medicine_id: parse_uuid(row.try_get("medicine_id")?)?,
            quantity,
            created_at: row.try_get("created_at")?,
        }))
    }

    pub async fn remove_from_cart(&self, user_id: UserId, item_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM cart_items WHERE id = ? AND user_id = ?")
            .bind(item_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::NotFound("Cart item".to_string()));
        }
        Ok(())
    }

    pub async fn clear_cart(&self, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Orders

    /// Turns the buyer's cart into an order.
    ///
    /// Runs in one transaction: stock is reserved with guarded decrements, prices come
    /// from the listings, and the cart is emptied. Any failure leaves cart and stock as
    /// they were.
    pub async fn checkout(&self, buyer_id: UserId, delivery_address: &str, delivery_fee: f64) -> Result<OrderDetail> {
        let mut tx = self.pool.begin().await?;
        let today = Utc::now().date_naive();

        let lines = sqlx::query(
            r#"
            SELECT c.medicine_id, c.quantity, m.name, m.cost_per_unit, m.sender_id, m.status,
                   m.quantity AS available, m.expiry_date
            FROM cart_items c JOIN medicines m ON m.id = c.medicine_id
            WHERE c.user_id = ?
            ORDER BY c.created_at ASC
            "#,
        )
        .bind(buyer_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        if lines.is_empty() {
            return Err(MarketError::Validation("Cart is empty".to_string()));
        }

        let now = Utc::now();
        let order_id: OrderId = Uuid::new_v4();
        let mut items = Vec::with_capacity(lines.len());

        for line in &lines {
            let medicine_id = parse_uuid(line.try_get("medicine_id")?)?;
            let quantity: i64 = line.try_get("quantity")?;
            let name: String = line.try_get("name")?;
            let unit_price: f64 = line.try_get("cost_per_unit")?;
            let available: i64 = line.try_get("available")?;
            let status = ListingStatus::from_str(&line.try_get::<String, _>("status")?)?;
            let expiry: NaiveDate = line.try_get("expiry_date")?;

            if status != ListingStatus::Approved || expiry <= today {
                return Err(MarketError::Conflict(format!("{} is no longer available", name)));
            }

            let reserved = sqlx::query(
                r#"
                UPDATE medicines SET quantity = quantity - ?, updated_at = ?
                WHERE id = ? AND quantity >= ? AND status = 'approved'
                "#,
            )
            .bind(quantity)
            .bind(now)
            .bind(medicine_id.to_string())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 0 {
                return Err(MarketError::InsufficientStock {
                    medicine: name,
                    requested: quantity,
                    available,
                });
            }

            items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id,
                medicine_id,
                medicine_name: name,
                sender_id: parse_uuid(line.try_get("sender_id")?)?,
                quantity,
                unit_price,
                total_price: round_money(unit_price * quantity as f64),
            });
        }

        let subtotal = round_money(items.iter().map(|item| item.total_price).sum());
        let delivery_fee = round_money(delivery_fee);
        let order = Order {
            id: order_id,
            buyer_id,
            subtotal,
            delivery_fee,
            total_amount: round_money(subtotal + delivery_fee),
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            delivery_status: DeliveryStatus::Pending,
            delivery_address: delivery_address.trim().to_string(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO orders (id, buyer_id, subtotal, delivery_fee, total_amount, payment_status, payment_id,
                                delivery_status, delivery_address, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.buyer_id.to_string())
        .bind(order.subtotal)
        .bind(order.delivery_fee)
        .bind(order.total_amount)
        .bind(order.payment_status.as_str())
        .bind(&order.payment_id)
        .bind(order.delivery_status.as_str())
        .bind(&order.delivery_address)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, medicine_id, medicine_name, sender_id, quantity, unit_price, total_price)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(item.order_id.to_string())
            .bind(item.medicine_id.to_string())
            .bind(&item.medicine_name)
            .bind(item.sender_id.to_string())
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total_price)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
            .bind(buyer_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            buyer_id = %buyer_id,
            items = items.len(),
            total = order.total_amount,
            "order created"
        );

        Ok(OrderDetail { order, items })
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
            .bind(order_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    pub async fn get_order_detail(&self, order_id: OrderId) -> Result<Option<OrderDetail>> {
        let Some(order) = self.get_order(order_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT id, order_id, medicine_id, medicine_name, sender_id, quantity, unit_price, total_price
            FROM order_items WHERE order_id = ? ORDER BY medicine_name ASC
            "#,
        )
        .bind(order_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(order_item_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Some(OrderDetail { order, items }))
    }

    pub async fn find_order_by_payment_id(&self, payment_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE payment_id = ?", ORDER_COLUMNS))
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    pub async fn list_orders_for_buyer(&self, buyer_id: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE buyer_id = ? ORDER BY created_at DESC",
            ORDER_COLUMNS
        ))
        .bind(buyer_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!("SELECT {} FROM orders ORDER BY created_at DESC", ORDER_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(order_from_row).collect()
    }

    pub async fn list_sales(&self, sender_id: UserId) -> Result<Vec<Sale>> {
        let rows = sqlx::query(
            r#"
            SELECT oi.id, oi.order_id, oi.medicine_id, oi.medicine_name, oi.sender_id, oi.quantity,
                   oi.unit_price, oi.total_price,
                   o.payment_status, o.delivery_status, o.delivery_address, o.created_at AS ordered_at,
                   u.organization_name AS buyer_name, u.pin_code AS buyer_pin_code
            FROM order_items oi
            JOIN orders o ON o.id = oi.order_id
            JOIN users u ON u.id = o.buyer_id
            WHERE oi.sender_id = ?
            ORDER BY o.created_at DESC
            "#,
        )
        .bind(sender_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Sale {
                    item: order_item_from_row(row)?,
                    buyer_name: row.try_get("buyer_name")?,
                    buyer_pin_code: row.try_get("buyer_pin_code")?,
                    payment_status: PaymentStatus::from_str(&row.try_get::<String, _>("payment_status")?)?,
                    delivery_status: DeliveryStatus::from_str(&row.try_get::<String, _>("delivery_status")?)?,
                    delivery_address: row.try_get("delivery_address")?,
                    ordered_at: row.try_get("ordered_at")?,
                })
            })
            .collect()
    }

    /// Moves an order's payment state. Repeating the current state is a no-op so
    /// redelivered provider events are harmless.
    pub async fn update_order_payment(
        &self,
        order_id: OrderId,
        payment_id: Option<&str>,
        status: PaymentStatus,
    ) -> Result<Order> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;

        if order.payment_status == status {
            return Ok(order);
        }
        if !order.payment_status.can_transition_to(status) {
            return Err(MarketError::InvalidTransition(format!(
                "payment {} -> {}",
                order.payment_status.as_str(),
                status.as_str()
            )));
        }
        if status == PaymentStatus::Paid && order.delivery_status == DeliveryStatus::Cancelled {
            return Err(MarketError::InvalidTransition("order is cancelled".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE orders SET payment_status = ?, payment_id = COALESCE(?, payment_id), updated_at = ?
            WHERE id = ? AND payment_status = ? AND delivery_status != 'cancelled'
            "#,
        )
        .bind(status.as_str())
        .bind(payment_id)
        .bind(Utc::now())
        .bind(order_id.to_string())
        .bind(order.payment_status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::InvalidTransition("order changed before payment was recorded".to_string()));
        }

        tracing::info!(order_id = %order_id, from = order.payment_status.as_str(), to = status.as_str(), "payment status changed");

        self.get_order(order_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))
    }

    /// Records a payment id before the provider reports an outcome.
    pub async fn attach_payment_id(&self, order_id: OrderId, payment_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET payment_id = ?, updated_at = ?
            WHERE id = ? AND payment_status IN ('pending', 'failed') AND delivery_status != 'cancelled'
            "#,
        )
        .bind(payment_id)
        .bind(Utc::now())
        .bind(order_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::InvalidTransition("order is not awaiting payment".to_string()));
        }
        Ok(())
    }

    /// Forgets an intent the provider has cancelled, so the order can be cancelled too.
    pub async fn release_payment_id(&self, order_id: OrderId, payment_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET payment_id = NULL, updated_at = ?
            WHERE id = ? AND payment_id = ? AND payment_status IN ('pending', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(order_id.to_string())
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records that money collected for an already cancelled order was sent back.
    pub async fn mark_cancelled_order_refunded(&self, order_id: OrderId, payment_id: &str) -> Result<Order> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET payment_status = 'refunded', payment_id = ?, updated_at = ?
            WHERE id = ? AND delivery_status = 'cancelled' AND payment_status IN ('pending', 'failed')
            "#,
        )
        .bind(payment_id)
        .bind(Utc::now())
        .bind(order_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::InvalidTransition("order is not a cancelled unpaid order".to_string()));
        }
        tracing::warn!(order_id = %order_id, payment_id = %payment_id, "payment for cancelled order refunded");

        self.get_order(order_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))
    }

    pub async fn update_order_delivery(&self, order_id: OrderId, status: DeliveryStatus) -> Result<Order> {
        if status == DeliveryStatus::Cancelled {
            return Err(MarketError::Validation("Orders are cancelled through the cancel action".to_string()));
        }

        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;

        if !order.delivery_status.can_transition_to(status) {
            return Err(MarketError::InvalidTransition(format!(
                "delivery {} -> {}",
                order.delivery_status.as_str(),
                status.as_str()
            )));
        }
        if status == DeliveryStatus::InTransit && order.payment_status != PaymentStatus::Paid {
            return Err(MarketError::InvalidTransition("order must be paid before dispatch".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE orders SET delivery_status = ?, updated_at = ?
            WHERE id = ? AND delivery_status = ? AND (? != 'in_transit' OR payment_status = 'paid')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(order_id.to_string())
        .bind(order.delivery_status.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MarketError::InvalidTransition("order changed before delivery was updated".to_string()));
        }

        tracing::info!(order_id = %order_id, to = status.as_str(), "delivery status changed");

        self.get_order(order_id)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))
    }

    /// Cancels an unpaid, undispatched order of `buyer_id` and returns its stock.
    pub async fn cancel_order(&self, buyer_id: UserId, order_id: OrderId) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ? AND buyer_id = ?", ORDER_COLUMNS))
            .bind(order_id.to_string())
            .bind(buyer_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;
        let order = order_from_row(&row)?;

        if !order.is_payable() || order.delivery_status != DeliveryStatus::Pending {
            return Err(MarketError::InvalidTransition(
                "only unpaid orders awaiting dispatch can be cancelled".to_string(),
            ));
        }
        if order.open_intent().is_some() {
            return Err(MarketError::InvalidTransition(
                "a card payment is in progress for this order".to_string(),
            ));
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE orders SET delivery_status = ?, updated_at = ?
            WHERE id = ? AND delivery_status = 'pending' AND payment_status IN ('pending', 'failed')
              AND (payment_id IS NULL OR payment_id LIKE 'test\_%' ESCAPE '\')
            "#,
        )
        .bind(DeliveryStatus::Cancelled.as_str())
        .bind(now)
        .bind(order_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MarketError::InvalidTransition("order changed before it could be cancelled".to_string()));
        }

        sqlx::query(
            r#"
            UPDATE medicines
            SET quantity = quantity + (SELECT SUM(oi.quantity) FROM order_items oi
                                       WHERE oi.order_id = ? AND oi.medicine_id = medicines.id),
                updated_at = ?
            WHERE id IN (SELECT medicine_id FROM order_items WHERE order_id = ?)
            "#,
        )
        .bind(order_id.to_string())
        .bind(now)
        .bind(order_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(order_id = %order_id, "order cancelled, stock restored");

        Ok(Order {
            delivery_status: DeliveryStatus::Cancelled,
            updated_at: now,
            ..order
        })
    }

    // Admin

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users WHERE is_verified = 1) AS total_users,
                (SELECT COUNT(*) FROM users WHERE role = 'pending') AS pending_approvals,
                (SELECT COUNT(*) FROM medicines WHERE status = 'approved') AS total_medicines,
                (SELECT COUNT(*) FROM medicines WHERE status = 'pending') AS pending_medicines,
                (SELECT COUNT(*) FROM orders) AS total_orders,
                (SELECT COALESCE(SUM(total_amount), 0.0) FROM orders WHERE payment_status = 'paid') AS paid_revenue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SystemStats {
            total_users: row.try_get("total_users")?,
            pending_approvals: row.try_get("pending_approvals")?,
            total_medicines: row.try_get("total_medicines")?,
            pending_medicines: row.try_get("pending_medicines")?,
            total_orders: row.try_get("total_orders")?,
            paid_revenue: round_money(row.try_get("paid_revenue")?),
        })
    }
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Ok(Uuid::parse_str(&value)?)
}

fn parse_json(value: Option<String>) -> Result<Option<serde_json::Value>> {
    Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
}

/// `LIKE` pattern matching `text` anywhere, with its wildcards taken literally.
fn contains_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: parse_uuid(row.try_get("id")?)?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        organization_name: row.try_get("organization_name")?,
        owner_name: row.try_get("owner_name")?,
        mobile: row.try_get("mobile")?,
        pin_code: row.try_get("pin_code")?,
        user_type: UserType::from_str(&row.try_get::<String, _>("user_type")?)?,
        gov_id_number: row.try_get("gov_id_number")?,
        aadhaar_number: row.try_get("aadhaar_number")?,
        is_verified: row.try_get("is_verified")?,
        role: Role::from_str(&row.try_get::<String, _>("role")?)?,
        verification: parse_json(row.try_get("verification")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn medicine_from_row(row: &SqliteRow) -> Result<Medicine> {
    Ok(Medicine {
        id: parse_uuid(row.try_get("id")?)?,
        sender_id: parse_uuid(row.try_get("sender_id")?)?,
        name: row.try_get("name")?,
        company: row.try_get("company")?,
        dosage: row.try_get("dosage")?,
        expiry_date: row.try_get("expiry_date")?,
        batch_number: row.try_get("batch_number")?,
        quantity: row.try_get("quantity")?,
        cost_per_unit: row.try_get("cost_per_unit")?,
        image_url: row.try_get("image_url")?,
        is_sealed: row.try_get("is_sealed")?,
        status: ListingStatus::from_str(&row.try_get::<String, _>("status")?)?,
        approved_by: row.try_get("approved_by")?,
        verification: parse_json(row.try_get("verification")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn medicine_view_from_row(row: &SqliteRow) -> Result<MedicineView> {
    Ok(MedicineView {
        medicine: medicine_from_row(row)?,
        sender_name: row.try_get("sender_name")?,
        sender_pin_code: row.try_get("sender_pin_code")?,
        distance_km: None,
    })
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    Ok(Order {
        id: parse_uuid(row.try_get("id")?)?,
        buyer_id: parse_uuid(row.try_get("buyer_id")?)?,
        subtotal: row.try_get("subtotal")?,
        delivery_fee: row.try_get("delivery_fee")?,
        total_amount: row.try_get("total_amount")?,
        payment_status: PaymentStatus::from_str(&row.try_get::<String, _>("payment_status")?)?,
        payment_id: row.try_get("payment_id")?,
        delivery_status: DeliveryStatus::from_str(&row.try_get::<String, _>("delivery_status")?)?,
        delivery_address: row.try_get("delivery_address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_item_from_row(row: &SqliteRow) -> Result<OrderItem> {
    Ok(OrderItem {
        id: parse_uuid(row.try_get("id")?)?,
        order_id: parse_uuid(row.try_get("order_id")?)?,
        medicine_id: parse_uuid(row.try_get("medicine_id")?)?,
        medicine_name: row.try_get("medicine_name")?,
        sender_id: parse_uuid(row.try_get("sender_id")?)?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        total_price: row.try_get("total_price")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("para"), "%para%");
        assert_eq!(contains_pattern("50%"), "%50\\%%");
        assert_eq!(contains_pattern("b_12\\x"), "%b\\_12\\\\x%");
    }
}
