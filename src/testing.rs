//! Тестовые двойники репозиториев и внешних сервисов.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    Apartment, Bill, BillType, ChatTarget, Invitation, Membership, NewApartment, NewBill, NewUser,
    Payment, PaymentHistoryEntry, PaymentStatus, ProfileChanges, ResidentInfo, User, UserRole,
};
use crate::repositories::{
    ApartmentRepository, BillRepository, MembershipRepository, PaymentRepository, Settlement,
    UserRepository,
};
use crate::services::{ImageStore, Notifier};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: HashMap<i64, User>,
    apartments: HashMap<i64, Apartment>,
    memberships: Vec<Membership>,
    bills: HashMap<i64, Bill>,
    payments: HashMap<i64, Payment>,
    failing_payment_users: HashSet<i64>,
    fail_bill_creation: bool,
    payment_insert_delay: Option<std::time::Duration>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_bill(&mut self, bill_id: i64) -> bool {
        self.payments.retain(|_, p| p.bill_id != bill_id);
        self.bills.remove(&bill_id).is_some()
    }
}

/// Все реляционные таблицы в памяти с каскадным удалением как в схеме.
#[derive(Default)]
pub struct MemoryDb {
    tables: Mutex<Tables>,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed_user(&self, username: &str, role: UserRole, telegram: Option<&str>) -> User {
        UserRepository::create(
            self,
            &NewUser {
                username: username.to_string(),
                password_hash: String::new(),
                email: format!("{}@example.com", username),
                phone: None,
                full_name: username.to_string(),
                role,
                telegram_user: telegram.map(str::to_string),
            },
        )
        .await
        .unwrap()
    }

    pub async fn seed_apartment(&self, name: &str, manager_id: i64) -> Apartment {
        self.create_with_manager(
            &NewApartment {
                name: name.to_string(),
                address: "Main st. 1".to_string(),
                units_count: 10,
            },
            manager_id,
        )
        .await
        .unwrap()
    }

    pub async fn seed_member(&self, user_id: i64, apartment_id: i64) {
        self.add(user_id, apartment_id, false).await.unwrap();
    }

    pub async fn seed_bill(&self, apartment_id: i64, bill_type: BillType, total: Decimal) -> Bill {
        BillRepository::create(
            self,
            &NewBill {
                apartment_id,
                bill_type,
                total_amount: total,
                due_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                billing_deadline: None,
                description: None,
                image_key: None,
            },
        )
        .await
        .unwrap()
    }

    pub async fn membership(&self, user_id: i64, apartment_id: i64) -> Option<Membership> {
        self.find(user_id, apartment_id).await.unwrap()
    }

    pub async fn payments_for_bill(&self, bill_id: i64) -> Vec<Payment> {
        self.list_by_bill(bill_id).await.unwrap()
    }

    pub async fn bill_count(&self) -> usize {
        self.tables.lock().await.bills.len()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn fail_payments_for(&self, user_id: i64) {
        self.tables.lock().await.failing_payment_users.insert(user_id);
    }

    pub async fn fail_bill_creation(&self) {
        self.tables.lock().await.fail_bill_creation = true;
    }

    /// Каждая вставка платежа ждёт `delay` до записи.
    pub async fn slow_payment_inserts(&self, delay: std::time::Duration) {
        self.tables.lock().await.payment_insert_delay = Some(delay);
    }
}

#[async_trait]
impl UserRepository for MemoryDb {
    async fn create(&self, user: &NewUser) -> AppResult<User> {
        let mut t = self.tables.lock().await;
        if t.users.values().any(|u| u.username == user.username) {
            return Err(AppError::Conflict("Имя пользователя уже занято".to_string()));
        }
        if user.telegram_user.is_some()
            && t.users.values().any(|u| u.telegram_user == user.telegram_user)
        {
            return Err(AppError::Conflict(
                "Telegram уже привязан к другому аккаунту".to_string(),
            ));
        }

        let now = Utc::now();
        let created = User {
            id: t.next_id(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            full_name: user.full_name.clone(),
            role: user.role,
            telegram_user: user.telegram_user.clone(),
            telegram_chat_id: 0,
            created_at: now,
            updated_at: now,
        };
        t.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users.values().find(|u| u.username == username).cloned())
    }

    async fn find_by_telegram(&self, telegram_user: &str) -> AppResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users
            .values()
            .find(|u| u.telegram_user.as_deref() == Some(telegram_user))
            .cloned())
    }

    async fn update_profile(&self, id: i64, changes: &ProfileChanges) -> AppResult<User> {
        let mut t = self.tables.lock().await;
        let user = t
            .users
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))?;
        if let Some(email) = &changes.email {
            user.email = email.clone();
        }
        if let Some(phone) = &changes.phone {
            user.phone = Some(phone.clone());
        }
        if let Some(full_name) = &changes.full_name {
            user.full_name = full_name.clone();
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_telegram(&self, id: i64, telegram_user: Option<&str>) -> AppResult<User> {
        let mut t = self.tables.lock().await;
        if let Some(name) = telegram_user {
            if t.users
                .values()
                .any(|u| u.id != id && u.telegram_user.as_deref() == Some(name))
            {
                return Err(AppError::Conflict(
                    "Telegram уже привязан к другому аккаунту".to_string(),
                ));
            }
        }
        let user = t
            .users
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))?;
        user.telegram_user = telegram_user.map(str::to_string);
        user.telegram_chat_id = 0;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn bind_chat(&self, telegram_user: &str, chat_id: i64) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        match t
            .users
            .values_mut()
            .find(|u| u.telegram_user.as_deref() == Some(telegram_user))
        {
            Some(user) => {
                user.telegram_chat_id = chat_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ApartmentRepository for MemoryDb {
    async fn create_with_manager(
        &self,
        apartment: &NewApartment,
        manager_id: i64,
    ) -> AppResult<Apartment> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let created = Apartment {
            id: t.next_id(),
            name: apartment.name.clone(),
            address: apartment.address.clone(),
            units_count: apartment.units_count,
            manager_id,
            created_at: now,
            updated_at: now,
        };
        t.apartments.insert(created.id, created.clone());
        t.memberships.push(Membership {
            user_id: manager_id,
            apartment_id: created.id,
            is_manager: true,
            joined_at: now,
        });
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<Apartment>> {
        Ok(self.tables.lock().await.apartments.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: i64) -> AppResult<Vec<Apartment>> {
        let t = self.tables.lock().await;
        let mut apartments: Vec<Apartment> = t
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| t.apartments.get(&m.apartment_id).cloned())
            .collect();
        apartments.sort_by_key(|a| a.id);
        Ok(apartments)
    }

    async fn update(&self, apartment: &Apartment) -> AppResult<Apartment> {
        let mut t = self.tables.lock().await;
        let stored = t
            .apartments
            .get_mut(&apartment.id)
            .ok_or_else(|| AppError::NotFound("Дом не найден".to_string()))?;
        stored.name = apartment.name.clone();
        stored.address = apartment.address.clone();
        stored.units_count = apartment.units_count;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        if t.apartments.remove(&id).is_none() {
            return Ok(false);
        }
        t.memberships.retain(|m| m.apartment_id != id);
        let bill_ids: Vec<i64> = t
            .bills
            .values()
            .filter(|b| b.apartment_id == id)
            .map(|b| b.id)
            .collect();
        for bill_id in bill_ids {
            t.drop_bill(bill_id);
        }
        Ok(true)
    }
}

#[async_trait]
impl MembershipRepository for MemoryDb {
    async fn find(&self, user_id: i64, apartment_id: i64) -> AppResult<Option<Membership>> {
        let t = self.tables.lock().await;
        Ok(t.memberships
            .iter()
            .find(|m| m.user_id == user_id && m.apartment_id == apartment_id)
            .cloned())
    }

    async fn add(&self, user_id: i64, apartment_id: i64, is_manager: bool) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        if t.memberships
            .iter()
            .any(|m| m.user_id == user_id && m.apartment_id == apartment_id)
        {
            return Ok(false);
        }
        t.memberships.push(Membership {
            user_id,
            apartment_id,
            is_manager,
            joined_at: Utc::now(),
        });
        Ok(true)
    }

    async fn remove(&self, user_id: i64, apartment_id: i64) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        let before = t.memberships.len();
        t.memberships
            .retain(|m| !(m.user_id == user_id && m.apartment_id == apartment_id && !m.is_manager));
        Ok(t.memberships.len() < before)
    }

    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Membership>> {
        let t = self.tables.lock().await;
        let mut members: Vec<Membership> = t
            .memberships
            .iter()
            .filter(|m| m.apartment_id == apartment_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.user_id);
        Ok(members)
    }

    async fn list_residents(&self, apartment_id: i64) -> AppResult<Vec<ResidentInfo>> {
        let t = self.tables.lock().await;
        let mut residents: Vec<ResidentInfo> = t
            .memberships
            .iter()
            .filter(|m| m.apartment_id == apartment_id)
            .filter_map(|m| {
                t.users.get(&m.user_id).map(|u| ResidentInfo {
                    user_id: u.id,
                    username: u.username.clone(),
                    full_name: u.full_name.clone(),
                    telegram_user: u.telegram_user.clone(),
                    is_manager: m.is_manager,
                    joined_at: m.joined_at,
                })
            })
            .collect();
        residents.sort_by_key(|r| (!r.is_manager, r.user_id));
        Ok(residents)
    }
}

#[async_trait]
impl BillRepository for MemoryDb {
    async fn create(&self, bill: &NewBill) -> AppResult<Bill> {
        let mut t = self.tables.lock().await;
        if t.fail_bill_creation {
            return Err(AppError::Internal("bill insert failed".to_string()));
        }
        let now = Utc::now();
        let created = Bill {
            id: t.next_id(),
            apartment_id: bill.apartment_id,
            bill_type: bill.bill_type,
            total_amount: bill.total_amount,
            due_date: bill.due_date,
            billing_deadline: bill.billing_deadline,
            description: bill.description.clone(),
            image_key: bill.image_key.clone(),
            created_at: now,
            updated_at: now,
        };
        t.bills.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<Bill>> {
        Ok(self.tables.lock().await.bills.get(&id).cloned())
    }

    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Bill>> {
        let t = self.tables.lock().await;
        let mut bills: Vec<Bill> = t
            .bills
            .values()
            .filter(|b| b.apartment_id == apartment_id)
            .cloned()
            .collect();
        bills.sort_by_key(|b| std::cmp::Reverse(b.id));
        Ok(bills)
    }

    async fn list_undivided(
        &self,
        apartment_id: i64,
        bill_type: Option<BillType>,
    ) -> AppResult<Vec<Bill>> {
        let t = self.tables.lock().await;
        let mut bills: Vec<Bill> = t
            .bills
            .values()
            .filter(|b| b.apartment_id == apartment_id)
            .filter(|b| bill_type.map_or(true, |ty| b.bill_type == ty))
            .filter(|b| !t.payments.values().any(|p| p.bill_id == b.id))
            .cloned()
            .collect();
        bills.sort_by_key(|b| std::cmp::Reverse(b.id));
        Ok(bills)
    }

    async fn update(&self, bill: &Bill) -> AppResult<Bill> {
        let mut t = self.tables.lock().await;
        let stored = t
            .bills
            .get_mut(&bill.id)
            .ok_or_else(|| AppError::NotFound("Счёт не найден".to_string()))?;
        *stored = Bill {
            updated_at: Utc::now(),
            ..bill.clone()
        };
        Ok(stored.clone())
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        Ok(self.tables.lock().await.drop_bill(id))
    }
}

#[async_trait]
impl PaymentRepository for MemoryDb {
    async fn create(&self, bill_id: i64, user_id: i64, amount: Decimal) -> AppResult<Payment> {
        let delay = self.tables.lock().await.payment_insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut t = self.tables.lock().await;
        if t.failing_payment_users.contains(&user_id) {
            return Err(AppError::Internal("payment insert failed".to_string()));
        }
        if t.payments
            .values()
            .any(|p| p.bill_id == bill_id && p.user_id == user_id)
        {
            return Err(AppError::Conflict("Платёж для жильца уже создан".to_string()));
        }
        let created = Payment {
            id: t.next_id(),
            bill_id,
            user_id,
            amount,
            status: PaymentStatus::Pending,
            paid_at: None,
            payment_reference: None,
            idempotency_key: None,
            created_at: Utc::now(),
        };
        t.payments.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_bill_and_user(
        &self,
        bill_id: i64,
        user_id: i64,
    ) -> AppResult<Option<Payment>> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .find(|p| p.bill_id == bill_id && p.user_id == user_id)
            .cloned())
    }

    async fn list_by_bill(&self, bill_id: i64) -> AppResult<Vec<Payment>> {
        self.select(|p| p.bill_id == bill_id).await
    }

    async fn list_unpaid_by_user(&self, user_id: i64) -> AppResult<Vec<Payment>> {
        self.select(|p| p.user_id == user_id && p.status != PaymentStatus::Paid)
            .await
    }

    async fn list_by_idempotency_key(&self, user_id: i64, key: &str) -> AppResult<Vec<Payment>> {
        self.select(|p| p.user_id == user_id && p.idempotency_key.as_deref() == Some(key))
            .await
    }

    async fn history(&self, user_id: i64) -> AppResult<Vec<PaymentHistoryEntry>> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .filter(|p| p.user_id == user_id && p.status == PaymentStatus::Paid)
            .filter_map(|p| {
                t.bills.get(&p.bill_id).map(|b| PaymentHistoryEntry {
                    payment_id: p.id,
                    bill_id: p.bill_id,
                    apartment_id: b.apartment_id,
                    bill_type: b.bill_type,
                    amount: p.amount,
                    status: p.status,
                    paid_at: p.paid_at,
                    payment_reference: p.payment_reference.clone(),
                })
            })
            .collect())
    }

    async fn mark_paid(&self, ids: &[i64], settlement: &Settlement) -> AppResult<u64> {
        let mut t = self.tables.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(payment) = t.payments.get_mut(id) {
                if payment.is_payable() {
                    payment.status = PaymentStatus::Paid;
                    payment.paid_at = Some(settlement.paid_at);
                    payment.payment_reference = Some(settlement.reference.clone());
                    payment.idempotency_key = Some(settlement.idempotency_key.clone());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn count_paid_for_bill(&self, bill_id: i64) -> AppResult<i64> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .filter(|p| p.bill_id == bill_id && p.status == PaymentStatus::Paid)
            .count() as i64)
    }
}

impl MemoryDb {
    async fn select(&self, filter: impl Fn(&Payment) -> bool) -> AppResult<Vec<Payment>> {
        let t = self.tables.lock().await;
        let mut payments: Vec<Payment> = t.payments.values().filter(|p| filter(p)).cloned().collect();
        payments.sort_by_key(|p| (p.bill_id, p.user_id));
        Ok(payments)
    }
}

/// Хранилище изображений в памяти; ссылка на отсутствующий ключ — ошибка.
#[derive(Default)]
pub struct MemoryImageStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    saves: Mutex<usize>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn saved(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn save(&self, bytes: Vec<u8>, filename: &str) -> AppResult<String> {
        let mut saves = self.saves.lock().await;
        *saves += 1;
        let key = format!("bills/{}-{}", *saves, filename);
        self.objects.lock().await.insert(key.clone(), bytes);
        Ok(key)
    }

    async fn url(&self, key: &str) -> AppResult<String> {
        if self.objects.lock().await.contains_key(key) {
            Ok(format!("memory://{}", key))
        } else {
            Err(AppError::Storage(format!("no such key: {}", key)))
        }
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

/// Записывает отправленные уведомления; может имитировать недоступный чат.
#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    messages: Mutex<Vec<(ChatTarget, String)>>,
    invitations: Mutex<Vec<String>>,
    bills: Mutex<Vec<(i64, i64, Decimal)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn messages(&self) -> Vec<(ChatTarget, String)> {
        self.messages.lock().await.clone()
    }

    pub async fn invitations(&self) -> Vec<String> {
        self.invitations.lock().await.clone()
    }

    pub async fn bill_notifications(&self) -> Vec<(i64, i64, Decimal)> {
        self.bills.lock().await.clone()
    }

    fn outcome(&self) -> AppResult<()> {
        if self.fail {
            Err(AppError::Chat("chat unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, target: &ChatTarget, text: &str) -> AppResult<()> {
        self.outcome()?;
        self.messages
            .lock()
            .await
            .push((target.clone(), text.to_string()));
        Ok(())
    }

    async fn send_invitation(&self, invitation: &Invitation) -> AppResult<()> {
        self.outcome()?;
        self.invitations
            .lock()
            .await
            .push(invitation.receiver_username.clone());
        Ok(())
    }

    async fn send_bill_notification(
        &self,
        user_id: i64,
        bill: &Bill,
        amount: Decimal,
    ) -> AppResult<()> {
        self.outcome()?;
        self.bills.lock().await.push((user_id, bill.id, amount));
        Ok(())
    }
}

pub fn test_config() -> Config {
    Config::from_yaml_str(
        r#"
database:
  username: app
  database: dom
storage:
  endpoint: localhost:9000
  access_key: minio
  secret_key: minio123
  bucket: receipts
auth:
  jwt_secret: test-secret
  token_ttl_secs: 3600
app_base_url: https://dom.example
"#,
    )
    .unwrap()
}
