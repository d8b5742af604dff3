use crate::error::{AppError, AppResult};
use crate::models::{
    Bill, BillFields, BillResponse, BillType, BillWarning, BillWithPaymentStatus,
    CreateBillResponse, ImageUpload, NewBill, PayBillsRequest, PayBillsResponse, Payment,
    PaymentHistoryEntry, PaymentInfo, UnpaidBill, UpdateBillRequest,
};
use crate::repositories::{BillRepository, MembershipRepository, PaymentRepository, Settlement};
use crate::services::file_service::{validate_image_content_type, MAX_IMAGE_SIZE};
use crate::services::{AccessOracle, GatewayError, ImageStore, Notifier, PaymentGateway};
use crate::utils::money::{self, Share, Split};
use crate::utils::validators::{non_empty, parse_date};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Политика деления и сроки, фиксируемые при сборке сервиса.
#[derive(Debug, Clone, Copy)]
pub struct BillingPolicy {
    /// Управляющий платит свою долю наравне с жильцами
    pub include_manager_in_split: bool,
    /// Срок деления от начала запроса; платежи, не успевшие записаться,
    /// попадают в warning. Должен быть меньше таймаута HTTP-запроса.
    pub request_deadline: Duration,
    pub gateway_timeout: Duration,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            include_manager_in_split: true,
            request_deadline: Duration::from_secs(30),
            gateway_timeout: Duration::from_secs(30),
        }
    }
}

pub struct BillService {
    bills: Arc<dyn BillRepository>,
    payments: Arc<dyn PaymentRepository>,
    memberships: Arc<dyn MembershipRepository>,
    access: AccessOracle,
    images: Arc<dyn ImageStore>,
    notifier: Arc<dyn Notifier>,
    gateway: Arc<dyn PaymentGateway>,
    policy: BillingPolicy,
}

struct FanOut {
    created: Vec<Share>,
    failed: Vec<i64>,
}

impl BillService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bills: Arc<dyn BillRepository>,
        payments: Arc<dyn PaymentRepository>,
        memberships: Arc<dyn MembershipRepository>,
        access: AccessOracle,
        images: Arc<dyn ImageStore>,
        notifier: Arc<dyn Notifier>,
        gateway: Arc<dyn PaymentGateway>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            bills,
            payments,
            memberships,
            access,
            images,
            notifier,
            gateway,
            policy,
        }
    }

    /// Создаёт счёт и сразу делит его между плательщиками дома.
    ///
    /// Порядок: загрузка изображения, запись счёта, платежи, уведомления.
    /// Если счёт не записался, загруженное изображение удаляется.
    /// Ошибки отдельных платежей не отменяют счёт и возвращаются в `warning`.
    pub async fn create_and_divide(
        &self,
        manager_id: i64,
        apartment_id: i64,
        fields: BillFields,
        image: Option<ImageUpload>,
    ) -> AppResult<CreateBillResponse> {
        let deadline = self.deadline_from(Instant::now());
        self.create_and_divide_until(deadline, manager_id, apartment_id, fields, image)
            .await
    }

    /// Срок деления для запроса, начатого в `started`.
    pub fn deadline_from(&self, started: Instant) -> Instant {
        started + self.policy.request_deadline
    }

    /// То же, что `create_and_divide`, со сроком, отсчитанным от начала запроса.
    pub async fn create_and_divide_until(
        &self,
        deadline: Instant,
        manager_id: i64,
        apartment_id: i64,
        fields: BillFields,
        image: Option<ImageUpload>,
    ) -> AppResult<CreateBillResponse> {
        self.access.require_manager(manager_id, apartment_id).await?;

        let mut new_bill = parse_bill_fields(apartment_id, &fields)?;
        if let Some(image) = &image {
            validate_image(image)?;
        }

        let payers = self.snapshot_payers(apartment_id).await?;
        let split = money::split_evenly(new_bill.total_amount, &payers)
            .ok_or_else(|| AppError::BadRequest("Сумма должна быть больше нуля".to_string()))?;

        let image_uploaded = image.is_some();
        if let Some(image) = image {
            let key = self.images.save(image.bytes, &image.filename).await?;
            new_bill.image_key = Some(key);
        }

        let bill = match self.bills.create(&new_bill).await {
            Ok(bill) => bill,
            Err(e) => {
                if let Some(key) = &new_bill.image_key {
                    self.discard_image(key).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Bill {} created for apartment {}: {} split between {} payer(s)",
            bill.id,
            apartment_id,
            bill.total_amount,
            split.shares.len()
        );

        Ok(self.divide(bill, split, deadline, image_uploaded).await)
    }

    /// Делит ранее созданный счёт без платежей.
    pub async fn divide_existing(
        &self,
        manager_id: i64,
        bill_id: i64,
    ) -> AppResult<CreateBillResponse> {
        let deadline = self.deadline_from(Instant::now());
        self.divide_existing_until(deadline, manager_id, bill_id).await
    }

    pub async fn divide_existing_until(
        &self,
        deadline: Instant,
        manager_id: i64,
        bill_id: i64,
    ) -> AppResult<CreateBillResponse> {
        let bill = self.find_bill(bill_id).await?;
        self.access
            .require_manager(manager_id, bill.apartment_id)
            .await?;

        if !self.payments.list_by_bill(bill.id).await?.is_empty() {
            return Err(AppError::Conflict("Счёт уже разделён".to_string()));
        }

        let payers = self.snapshot_payers(bill.apartment_id).await?;
        let split = money::split_evenly(bill.total_amount, &payers)
            .ok_or_else(|| AppError::BadRequest("Сумма должна быть больше нуля".to_string()))?;

        let image_uploaded = bill.image_key.is_some();
        Ok(self.divide(bill, split, deadline, image_uploaded).await)
    }

    async fn divide(
        &self,
        bill: Bill,
        split: Split,
        deadline: Instant,
        image_uploaded: bool,
    ) -> CreateBillResponse {
        let residents_count = split.shares.len();
        let fan_out = self.create_payments(bill.id, split.shares, deadline).await;

        let warning = if fan_out.failed.is_empty() {
            None
        } else {
            Some(BillWarning {
                message: "Не удалось создать платежи для части жильцов".to_string(),
                user_ids: fan_out.failed,
            })
        };

        let bill_id = bill.id;
        self.notify_payers(bill, fan_out.created);

        CreateBillResponse {
            bill_id,
            residents_count,
            amount_per_person: split.per_person,
            image_uploaded,
            warning,
        }
    }

    /// Плательщики на момент вызова. Нужен хотя бы один жилец помимо управляющего.
    async fn snapshot_payers(&self, apartment_id: i64) -> AppResult<Vec<i64>> {
        let members = self.memberships.list_by_apartment(apartment_id).await?;

        if !members.iter().any(|m| !m.is_manager) {
            return Err(AppError::Conflict(
                "В доме нет жильцов для деления счёта".to_string(),
            ));
        }

        Ok(members
            .into_iter()
            .filter(|m| self.policy.include_manager_in_split || !m.is_manager)
            .map(|m| m.user_id)
            .collect())
    }

    async fn create_payments(&self, bill_id: i64, shares: Vec<Share>, deadline: Instant) -> FanOut {
        let mut fan_out = FanOut {
            created: Vec::with_capacity(shares.len()),
            failed: Vec::new(),
        };

        for share in shares {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Deadline reached, payment for user {} on bill {} skipped",
                    share.user_id,
                    bill_id
                );
                fan_out.failed.push(share.user_id);
                continue;
            }

            let insert = self.payments.create(bill_id, share.user_id, share.amount);
            match tokio::time::timeout_at(deadline, insert).await {
                Ok(Ok(_)) => fan_out.created.push(share),
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Failed to create payment for user {} on bill {}: {}",
                        share.user_id,
                        bill_id,
                        e
                    );
                    fan_out.failed.push(share.user_id);
                }
                Err(_) => {
                    tracing::warn!(
                        "Payment insert for user {} on bill {} timed out",
                        share.user_id,
                        bill_id
                    );
                    fan_out.failed.push(share.user_id);
                }
            }
        }

        fan_out
    }

    fn notify_payers(&self, bill: Bill, shares: Vec<Share>) {
        if shares.is_empty() {
            return;
        }

        let notifier = self.notifier.clone();
        let bill = Arc::new(bill);
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for share in shares {
                let notifier = notifier.clone();
                let bill = bill.clone();
                tasks.spawn(async move {
                    let result = notifier
                        .send_bill_notification(share.user_id, &bill, share.amount)
                        .await;
                    (share.user_id, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((user_id, Err(e))) => {
                        tracing::warn!("Bill notification for user {} failed: {}", user_id, e)
                    }
                    Err(e) => tracing::warn!("Bill notification task failed: {}", e),
                }
            }
        });
    }

    pub async fn get_bill(&self, user_id: i64, bill_id: i64) -> AppResult<BillResponse> {
        let bill = self.find_bill(bill_id).await?;
        self.access.require_member(user_id, bill.apartment_id).await?;

        let image_url = self.resolve_image_url(bill.image_key.as_deref()).await;
        Ok(BillResponse::new(bill, image_url))
    }

    pub async fn list_bills(
        &self,
        manager_id: i64,
        apartment_id: i64,
        bill_type: Option<BillType>,
        undivided: bool,
    ) -> AppResult<Vec<BillResponse>> {
        self.access.require_manager(manager_id, apartment_id).await?;

        let bills = if undivided {
            self.bills.list_undivided(apartment_id, bill_type).await?
        } else {
            self.bills
                .list_by_apartment(apartment_id)
                .await?
                .into_iter()
                .filter(|b| bill_type.map_or(true, |t| b.bill_type == t))
                .collect()
        };

        let mut responses = Vec::with_capacity(bills.len());
        for bill in bills {
            let image_url = self.resolve_image_url(bill.image_key.as_deref()).await;
            responses.push(BillResponse::new(bill, image_url));
        }
        Ok(responses)
    }

    pub async fn update_bill(
        &self,
        manager_id: i64,
        request: UpdateBillRequest,
    ) -> AppResult<BillResponse> {
        let mut bill = self.find_bill(request.id).await?;
        self.access
            .require_manager(manager_id, bill.apartment_id)
            .await?;

        if let Some(value) = &request.bill_type {
            bill.bill_type = BillType::parse(value)
                .ok_or_else(|| AppError::BadRequest("Неверный тип счёта".to_string()))?;
        }

        if let Some(total) = request.total_amount {
            let total = positive_amount(total)?;
            if total != bill.total_amount && !self.payments.list_by_bill(bill.id).await?.is_empty()
            {
                return Err(AppError::Conflict(
                    "Нельзя изменить сумму уже разделённого счёта".to_string(),
                ));
            }
            bill.total_amount = total;
        }

        if let Some(value) = &request.due_date {
            bill.due_date = parse_required_date(value, "due_date")?;
        }

        if let Some(value) = request.billing_deadline {
            bill.billing_deadline = match non_empty(Some(value)) {
                Some(value) => Some(parse_required_date(&value, "billing_deadline")?),
                None => None,
            };
        }
        check_deadline(bill.billing_deadline, bill.due_date)?;

        if let Some(description) = request.description {
            bill.description = non_empty(Some(description));
        }

        let bill = self.bills.update(&bill).await?;
        tracing::info!("Bill {} updated by {}", bill.id, manager_id);

        let image_url = self.resolve_image_url(bill.image_key.as_deref()).await;
        Ok(BillResponse::new(bill, image_url))
    }

    /// Удаляет счёт вместе с платежами. Счёт с оплаченными долями не удаляется.
    pub async fn delete_bill(&self, manager_id: i64, bill_id: i64) -> AppResult<()> {
        let bill = self.find_bill(bill_id).await?;
        self.access
            .require_manager(manager_id, bill.apartment_id)
            .await?;

        if self.payments.count_paid_for_bill(bill.id).await? > 0 {
            return Err(AppError::Conflict(
                "По счёту уже есть оплаты, удаление невозможно".to_string(),
            ));
        }

        if !self.bills.delete(bill.id).await? {
            return Err(AppError::NotFound("Счёт не найден".to_string()));
        }

        if let Some(key) = &bill.image_key {
            self.discard_image(key).await;
        }

        tracing::info!("Bill {} deleted by {}", bill.id, manager_id);
        Ok(())
    }

    /// Пакетная оплата через шлюз.
    ///
    /// Без `bill_ids` берутся все неоплаченные доли вызывающего. Уже оплаченные
    /// доли в выборке считаются успехом, поэтому повтор с тем же ключом
    /// возвращает то же количество счетов с нулевой суммой. Ключ действует
    /// в пределах пользователя и привязан к набору долей, оплаченных с ним:
    /// новые доли под уже использованным ключом отклоняются. При отказе шлюза
    /// статусы платежей не меняются.
    pub async fn pay_batch(
        &self,
        user_id: i64,
        request: PayBillsRequest,
    ) -> AppResult<PayBillsResponse> {
        let key = request.idempotency_key.trim().to_string();
        if key.is_empty() {
            return Err(AppError::BadRequest(
                "idempotency_key обязателен".to_string(),
            ));
        }

        let under_key = self.payments.list_by_idempotency_key(user_id, &key).await?;

        let (payable, settled) = if request.bill_ids.is_empty() {
            let payable = self.payments.list_unpaid_by_user(user_id).await?;
            if payable.is_empty() && under_key.is_empty() {
                return Err(AppError::Conflict("Нет неоплаченных счетов".to_string()));
            }
            if payable.is_empty() {
                (payable, under_key.clone())
            } else {
                (payable, Vec::new())
            }
        } else {
            self.select_owed(user_id, &request.bill_ids).await?
        };

        if !payable.is_empty() && !under_key.is_empty() {
            return Err(AppError::Conflict(
                "Ключ идемпотентности уже использован для других счетов".to_string(),
            ));
        }

        if payable.is_empty() {
            tracing::debug!("Pay replay for user {} with key {}", user_id, key);
            return Ok(PayBillsResponse {
                bills_paid: settled.len(),
                total_amount: money::zero(),
                payment_reference: under_key.iter().find_map(|p| p.payment_reference.clone()),
            });
        }

        let ids: Vec<i64> = payable.iter().map(|p| p.id).collect();
        let total = money::normalize(payable.iter().map(|p| p.amount).sum::<Decimal>());

        let receipt = tokio::time::timeout(
            self.policy.gateway_timeout,
            self.gateway.pay_bills(&ids, &gateway_key(user_id, &key)),
        )
        .await
        .map_err(|_| AppError::Timeout("payment gateway".to_string()))?
        .map_err(|e| match e {
            GatewayError::KeyReused => AppError::Conflict(
                "Ключ идемпотентности уже использован для других счетов".to_string(),
            ),
            e => {
                tracing::warn!("Gateway refused payment for user {}: {}", user_id, e);
                AppError::PaymentFailed(e.to_string())
            }
        })?;

        let settlement = Settlement {
            paid_at: Utc::now(),
            reference: receipt.reference,
            idempotency_key: key,
        };
        let updated = self.payments.mark_paid(&ids, &settlement).await?;
        if updated < ids.len() as u64 {
            tracing::debug!(
                "{} of {} payment(s) were settled concurrently",
                ids.len() as u64 - updated,
                ids.len()
            );
        }

        tracing::info!(
            "User {} paid {} bill(s), total {}, reference {}",
            user_id,
            ids.len() + settled.len(),
            total,
            settlement.reference
        );

        Ok(PayBillsResponse {
            bills_paid: ids.len() + settled.len(),
            total_amount: total,
            payment_reference: Some(settlement.reference),
        })
    }

    /// Разбивает явный список счетов на подлежащие оплате и уже оплаченные.
    /// Счёт без доли вызывающего означает чужой платёж.
    async fn select_owed(
        &self,
        user_id: i64,
        bill_ids: &[i64],
    ) -> AppResult<(Vec<Payment>, Vec<Payment>)> {
        let mut ids = bill_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut payable = Vec::new();
        let mut settled = Vec::new();
        for bill_id in ids {
            let payment = self
                .payments
                .find_by_bill_and_user(bill_id, user_id)
                .await?
                .ok_or(AppError::Forbidden)?;

            if payment.is_payable() {
                payable.push(payment);
            } else {
                settled.push(payment);
            }
        }
        Ok((payable, settled))
    }

    pub async fn unpaid_bills(&self, user_id: i64) -> AppResult<Vec<UnpaidBill>> {
        let payments = self.payments.list_unpaid_by_user(user_id).await?;

        let mut unpaid = Vec::with_capacity(payments.len());
        for payment in payments {
            let Some(bill) = self.bills.find_by_id(payment.bill_id).await? else {
                continue;
            };
            unpaid.push(UnpaidBill {
                bill_id: bill.id,
                apartment_id: bill.apartment_id,
                bill_type: bill.bill_type,
                total_amount: bill.total_amount,
                amount_due: payment.amount,
                due_date: bill.due_date,
                billing_deadline: bill.billing_deadline,
                description: bill.description,
                payment_status: payment.status,
            });
        }
        Ok(unpaid)
    }

    pub async fn bill_with_payment_status(
        &self,
        user_id: i64,
        bill_id: i64,
    ) -> AppResult<BillWithPaymentStatus> {
        let bill = self.find_bill(bill_id).await?;
        self.access.require_member(user_id, bill.apartment_id).await?;

        let payment = self
            .payments
            .find_by_bill_and_user(bill.id, user_id)
            .await?
            .map(PaymentInfo::from);

        let image_url = self.resolve_image_url(bill.image_key.as_deref()).await;
        Ok(BillWithPaymentStatus {
            bill: BillResponse::new(bill, image_url),
            payment,
        })
    }

    pub async fn payment_history(&self, user_id: i64) -> AppResult<Vec<PaymentHistoryEntry>> {
        self.payments.history(user_id).await
    }

    async fn find_bill(&self, bill_id: i64) -> AppResult<Bill> {
        self.bills
            .find_by_id(bill_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Счёт не найден".to_string()))
    }

    async fn resolve_image_url(&self, key: Option<&str>) -> String {
        let Some(key) = key else {
            return String::new();
        };
        match self.images.url(key).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Failed to resolve image url for {}: {}", key, e);
                String::new()
            }
        }
    }

    async fn discard_image(&self, key: &str) {
        if let Err(e) = self.images.delete(key).await {
            tracing::warn!("Failed to delete image {}: {}", key, e);
        }
    }
}

/// Ключ для шлюза: один и тот же клиентский ключ у разных пользователей
/// означает разные списания.
fn gateway_key(user_id: i64, key: &str) -> String {
    format!("{}:{}", user_id, key)
}

/// Проверка и нормализация полей нового счёта.
pub fn parse_bill_fields(apartment_id: i64, fields: &BillFields) -> AppResult<NewBill> {
    let bill_type = BillType::parse(&fields.bill_type)
        .ok_or_else(|| AppError::BadRequest("Неверный тип счёта".to_string()))?;

    let total_amount = Decimal::from_str(fields.total_amount.trim())
        .map_err(|_| AppError::BadRequest("Неверная сумма".to_string()))?;
    let total_amount = positive_amount(total_amount)?;

    let due_date = parse_required_date(&fields.due_date, "due_date")?;
    let billing_deadline = match non_empty(fields.billing_deadline.clone()) {
        Some(value) => Some(parse_required_date(&value, "billing_deadline")?),
        None => None,
    };
    check_deadline(billing_deadline, due_date)?;

    Ok(NewBill {
        apartment_id,
        bill_type,
        total_amount,
        due_date,
        billing_deadline,
        description: non_empty(fields.description.clone()),
        image_key: None,
    })
}

fn positive_amount(amount: Decimal) -> AppResult<Decimal> {
    let amount = money::normalize(amount);
    if amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(
            "Сумма должна быть больше нуля".to_string(),
        ));
    }
    if amount > money::max_amount() {
        return Err(AppError::BadRequest(format!(
            "Сумма не может превышать {}",
            money::max_amount()
        )));
    }
    Ok(amount)
}

fn parse_required_date(value: &str, field: &str) -> AppResult<NaiveDate> {
    parse_date(value).ok_or_else(|| {
        AppError::BadRequest(format!("{}: ожидается дата в формате YYYY-MM-DD", field))
    })
}

fn check_deadline(deadline: Option<NaiveDate>, due_date: NaiveDate) -> AppResult<()> {
    match deadline {
        Some(deadline) if deadline > due_date => Err(AppError::BadRequest(
            "billing_deadline не может быть позже due_date".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_image(image: &ImageUpload) -> AppResult<()> {
    if !validate_image_content_type(&image.content_type) {
        return Err(AppError::BadRequest(
            "Допустимы только изображения JPEG, PNG, GIF или WebP".to_string(),
        ));
    }
    if image.bytes.is_empty() || image.bytes.len() > MAX_IMAGE_SIZE {
        return Err(AppError::BadRequest(
            "Размер изображения должен быть от 1 байта до 10 МБ".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentStatus, UserRole};
    use crate::services::{GatewayError, GatewayReceipt, SandboxGateway};
    use crate::testing::{MemoryDb, MemoryImageStore, RecordingNotifier};
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn water_bill(total: &str) -> BillFields {
        BillFields {
            bill_type: "water".to_string(),
            total_amount: total.to_string(),
            due_date: "2024-01-15".to_string(),
            billing_deadline: Some("2024-01-10".to_string()),
            description: None,
        }
    }

    fn receipt_image() -> ImageUpload {
        ImageUpload {
            bytes: vec![0xFF, 0xD8, 0xFF],
            filename: "receipt.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
        }
    }

    struct DecliningGateway;

    #[async_trait]
    impl PaymentGateway for DecliningGateway {
        async fn pay_bills(&self, _: &[i64], _: &str) -> Result<GatewayReceipt, GatewayError> {
            Err(GatewayError::Declined("insufficient funds".to_string()))
        }
    }

    struct Fixture {
        db: Arc<MemoryDb>,
        images: Arc<MemoryImageStore>,
        gateway: Arc<SandboxGateway>,
        service: BillService,
        manager_id: i64,
        apartment_id: i64,
    }

    async fn fixture_with(policy: BillingPolicy, gateway: Option<Arc<dyn PaymentGateway>>) -> Fixture {
        let db = MemoryDb::new();
        let images = Arc::new(MemoryImageStore::new());
        let sandbox = Arc::new(SandboxGateway::new());
        let gateway: Arc<dyn PaymentGateway> = gateway.unwrap_or_else(|| sandbox.clone() as Arc<dyn PaymentGateway>);

        let manager = db.seed_user("alice", UserRole::Manager, None).await;
        let apartment = db.seed_apartment("Sunny", manager.id).await;

        let service = BillService::new(
            db.clone(),
            db.clone(),
            db.clone(),
            AccessOracle::new(db.clone()),
            images.clone(),
            Arc::new(RecordingNotifier::new()),
            gateway,
            policy,
        );

        Fixture {
            db,
            images,
            gateway: sandbox,
            service,
            manager_id: manager.id,
            apartment_id: apartment.id,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(BillingPolicy::default(), None).await
    }

    impl Fixture {
        async fn resident(&self, name: &str) -> i64 {
            let user = self.db.seed_user(name, UserRole::Resident, None).await;
            self.db.seed_member(user.id, self.apartment_id).await;
            user.id
        }
    }

    #[tokio::test]
    async fn test_scenario_two_payers_split_evenly() {
        let f = fixture().await;
        let bob = f.resident("bob").await;

        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("100.00"), None)
            .await
            .unwrap();

        assert_eq!(created.residents_count, 2);
        assert_eq!(created.amount_per_person.to_string(), "50.00");
        assert!(created.warning.is_none());

        let payments = f.db.payments_for_bill(created.bill_id).await;
        assert_eq!(payments.len(), 2);
        for payment in &payments {
            assert_eq!(payment.amount.to_string(), "50.00");
            assert_eq!(payment.status, PaymentStatus::Pending);
        }
        assert!(payments.iter().any(|p| p.user_id == bob));
        assert!(payments.iter().any(|p| p.user_id == f.manager_id));
    }

    #[tokio::test]
    async fn test_residual_cent_goes_to_lowest_id() {
        let policy = BillingPolicy {
            include_manager_in_split: false,
            ..BillingPolicy::default()
        };
        let f = fixture_with(policy, None).await;
        let ids = vec![
            f.resident("bob").await,
            f.resident("carol").await,
            f.resident("dave").await,
        ];

        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("100.01"), None)
            .await
            .unwrap();
        assert_eq!(created.residents_count, 3);

        let mut payments = f.db.payments_for_bill(created.bill_id).await;
        payments.sort_by_key(|p| p.user_id);
        let amounts: Vec<String> = payments.iter().map(|p| p.amount.to_string()).collect();
        assert_eq!(amounts, vec!["33.35", "33.33", "33.33"]);
        assert_eq!(payments[0].user_id, *ids.iter().min().unwrap());

        let sum: Decimal = payments.iter().map(|p| p.amount).sum();
        assert_eq!(sum, dec("100.01"));
    }

    #[tokio::test]
    async fn test_validation_and_preconditions() {
        let f = fixture().await;

        let err = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("100.00"), None)
            .await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        let bob = f.resident("bob").await;
        let err = f
            .service
            .create_and_divide(bob, f.apartment_id, water_bill("100.00"), None)
            .await;
        assert!(matches!(err, Err(AppError::Forbidden)));

        for fields in [
            BillFields { bill_type: "steam".to_string(), ..water_bill("10.00") },
            water_bill("0.00"),
            water_bill("abc"),
            water_bill("10000000000.00"),
            water_bill("79228162514264337593543950335"),
            BillFields { due_date: "15.01.2024".to_string(), ..water_bill("10.00") },
            BillFields { billing_deadline: Some("2024-02-01".to_string()), ..water_bill("10.00") },
        ] {
            let err = f
                .service
                .create_and_divide(f.manager_id, f.apartment_id, fields, None)
                .await;
            assert!(matches!(err, Err(AppError::BadRequest(_))));
        }

        assert_eq!(f.db.bill_count().await, 0);
    }

    #[tokio::test]
    async fn test_partial_payment_failure_is_reported() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let carol = f.resident("carol").await;
        f.db.fail_payments_for(carol).await;

        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("90.00"), None)
            .await
            .unwrap();

        let warning = created.warning.unwrap();
        assert_eq!(warning.user_ids, vec![carol]);

        let payments = f.db.payments_for_bill(created.bill_id).await;
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().any(|p| p.user_id == bob));
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_fan_out() {
        let policy = BillingPolicy {
            request_deadline: Duration::ZERO,
            ..BillingPolicy::default()
        };
        let f = fixture_with(policy, None).await;
        let bob = f.resident("bob").await;

        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("10.00"), None)
            .await
            .unwrap();

        let mut skipped = created.warning.unwrap().user_ids;
        skipped.sort_unstable();
        assert_eq!(skipped, vec![f.manager_id.min(bob), f.manager_id.max(bob)]);
        assert!(f.db.payments_for_bill(created.bill_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_image_removed_when_bill_insert_fails() {
        let f = fixture().await;
        f.resident("bob").await;
        f.db.fail_bill_creation().await;

        let err = f
            .service
            .create_and_divide(
                f.manager_id,
                f.apartment_id,
                water_bill("10.00"),
                Some(receipt_image()),
            )
            .await;

        assert!(err.is_err());
        assert_eq!(f.images.saved().await, 1);
        assert!(f.images.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_image_upload() {
        let f = fixture().await;
        f.resident("bob").await;

        let upload = ImageUpload {
            content_type: "application/pdf".to_string(),
            ..receipt_image()
        };
        let err = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("10.00"), Some(upload))
            .await;

        assert!(matches!(err, Err(AppError::BadRequest(_))));
        assert_eq!(f.images.saved().await, 0);
    }

    #[tokio::test]
    async fn test_get_bill_with_missing_image_degrades() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let created = f
            .service
            .create_and_divide(
                f.manager_id,
                f.apartment_id,
                water_bill("10.00"),
                Some(receipt_image()),
            )
            .await
            .unwrap();
        assert!(created.image_uploaded);

        let bill = f.service.get_bill(bob, created.bill_id).await.unwrap();
        assert!(bill.image_url.starts_with("memory://"));

        for key in f.images.keys().await {
            f.images.delete(&key).await.unwrap();
        }
        let bill = f.service.get_bill(bob, created.bill_id).await.unwrap();
        assert_eq!(bill.image_url, "");
        assert_eq!(bill.total_amount.to_string(), "10.00");

        let outsider = f.db.seed_user("eve", UserRole::Resident, None).await;
        let err = f.service.get_bill(outsider.id, created.bill_id).await;
        assert!(matches!(err, Err(AppError::Forbidden)));
    }

    #[tokio::test]
    async fn test_pay_batch_is_idempotent() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        for total in ["100.00", "30.00"] {
            f.service
                .create_and_divide(f.manager_id, f.apartment_id, water_bill(total), None)
                .await
                .unwrap();
        }

        let request = || PayBillsRequest {
            bill_ids: vec![],
            idempotency_key: "K1".to_string(),
        };

        let first = f.service.pay_batch(bob, request()).await.unwrap();
        assert_eq!(first.bills_paid, 2);
        assert_eq!(first.total_amount.to_string(), "65.00");
        assert!(f.service.unpaid_bills(bob).await.unwrap().is_empty());

        let second = f.service.pay_batch(bob, request()).await.unwrap();
        assert_eq!(second.bills_paid, 2);
        assert_eq!(second.total_amount.to_string(), "0.00");
        assert_eq!(second.payment_reference, first.payment_reference);

        assert_eq!(f.gateway.charges().await, 1);
        assert_eq!(f.service.payment_history(bob).await.unwrap().len(), 2);

        let err = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![],
                    idempotency_key: "K2".to_string(),
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_same_key_from_two_residents_charges_each() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let carol = f.resident("carol").await;
        f.service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("90.00"), None)
            .await
            .unwrap();

        let request = || PayBillsRequest {
            bill_ids: vec![],
            idempotency_key: "K1".to_string(),
        };

        let by_bob = f.service.pay_batch(bob, request()).await.unwrap();
        let by_carol = f.service.pay_batch(carol, request()).await.unwrap();

        assert_eq!(by_bob.total_amount.to_string(), "30.00");
        assert_eq!(by_carol.total_amount.to_string(), "30.00");
        assert_ne!(by_bob.payment_reference, by_carol.payment_reference);
        assert_eq!(f.gateway.charges().await, 2);
        assert!(f.service.unpaid_bills(carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_reused_for_new_bill_is_refused() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        f.service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("100.00"), None)
            .await
            .unwrap();

        let request = |key: &str| PayBillsRequest {
            bill_ids: vec![],
            idempotency_key: key.to_string(),
        };
        f.service.pay_batch(bob, request("K1")).await.unwrap();

        let later = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("500.00"), None)
            .await
            .unwrap();

        let err = f.service.pay_batch(bob, request("K1")).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        let err = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![later.bill_id],
                    idempotency_key: "K1".to_string(),
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        assert_eq!(f.service.unpaid_bills(bob).await.unwrap().len(), 1);
        assert_eq!(f.gateway.charges().await, 1);

        let paid = f.service.pay_batch(bob, request("K2")).await.unwrap();
        assert_eq!(paid.total_amount.to_string(), "250.00");
        assert_eq!(f.gateway.charges().await, 2);
    }

    #[tokio::test]
    async fn test_pay_after_charge_without_settlement_is_not_charged_twice() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("40.00"), None)
            .await
            .unwrap();

        let share = f
            .db
            .payments_for_bill(created.bill_id)
            .await
            .into_iter()
            .find(|p| p.user_id == bob)
            .unwrap();
        let charged = f
            .gateway
            .pay_bills(&[share.id], &gateway_key(bob, "K1"))
            .await
            .unwrap();

        let paid = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![],
                    idempotency_key: "K1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(paid.payment_reference, Some(charged.reference));
        assert_eq!(f.gateway.charges().await, 1);
        assert!(f.service.unpaid_bills(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pay_explicit_bills() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let first = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("20.00"), None)
            .await
            .unwrap();
        let second = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("40.00"), None)
            .await
            .unwrap();

        let paid = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![first.bill_id],
                    idempotency_key: "A".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.bills_paid, 1);
        assert_eq!(paid.total_amount.to_string(), "10.00");

        let status = f
            .service
            .bill_with_payment_status(bob, second.bill_id)
            .await
            .unwrap();
        assert_eq!(status.payment.unwrap().status, PaymentStatus::Pending);

        let overlapping = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![first.bill_id, second.bill_id],
                    idempotency_key: "B".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(overlapping.bills_paid, 2);
        assert_eq!(overlapping.total_amount.to_string(), "20.00");

        let outsider = f.db.seed_user("eve", UserRole::Resident, None).await;
        let err = f
            .service
            .pay_batch(
                outsider.id,
                PayBillsRequest {
                    bill_ids: vec![first.bill_id],
                    idempotency_key: "C".to_string(),
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Forbidden)));
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_payments_pending() {
        let f = fixture_with(BillingPolicy::default(), Some(Arc::new(DecliningGateway))).await;
        let bob = f.resident("bob").await;
        f.service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("10.00"), None)
            .await
            .unwrap();

        let err = f
            .service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![],
                    idempotency_key: "K1".to_string(),
                },
            )
            .await;

        assert!(matches!(err, Err(AppError::PaymentFailed(_))));
        let unpaid = f.service.unpaid_bills(bob).await.unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(unpaid[0].payment_status, PaymentStatus::Pending);
        assert_eq!(unpaid[0].amount_due.to_string(), "5.00");
    }

    #[tokio::test]
    async fn test_update_and_delete_rules() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("10.00"), None)
            .await
            .unwrap();

        let err = f
            .service
            .update_bill(
                bob,
                UpdateBillRequest {
                    id: created.bill_id,
                    bill_type: Some("gas".to_string()),
                    total_amount: None,
                    due_date: None,
                    billing_deadline: None,
                    description: None,
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Forbidden)));

        let err = f
            .service
            .update_bill(
                f.manager_id,
                UpdateBillRequest {
                    id: created.bill_id,
                    bill_type: None,
                    total_amount: Some(dec("12.00")),
                    due_date: None,
                    billing_deadline: None,
                    description: None,
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        let err = f
            .service
            .update_bill(
                f.manager_id,
                UpdateBillRequest {
                    id: created.bill_id,
                    bill_type: None,
                    total_amount: Some(dec("10000000000.00")),
                    due_date: None,
                    billing_deadline: None,
                    description: None,
                },
            )
            .await;
        assert!(matches!(err, Err(AppError::BadRequest(_))));

        let updated = f
            .service
            .update_bill(
                f.manager_id,
                UpdateBillRequest {
                    id: created.bill_id,
                    bill_type: Some("gas".to_string()),
                    total_amount: Some(dec("10")),
                    due_date: None,
                    billing_deadline: Some(String::new()),
                    description: Some("Январь".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.bill_type, BillType::Gas);
        assert!(updated.billing_deadline.is_none());
        assert_eq!(updated.description.as_deref(), Some("Январь"));

        f.service
            .pay_batch(
                bob,
                PayBillsRequest {
                    bill_ids: vec![created.bill_id],
                    idempotency_key: "K".to_string(),
                },
            )
            .await
            .unwrap();

        let err = f.service.delete_bill(f.manager_id, created.bill_id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
        assert_eq!(f.db.bill_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_payments_and_image() {
        let f = fixture().await;
        f.resident("bob").await;
        let created = f
            .service
            .create_and_divide(
                f.manager_id,
                f.apartment_id,
                water_bill("10.00"),
                Some(receipt_image()),
            )
            .await
            .unwrap();

        f.service
            .delete_bill(f.manager_id, created.bill_id)
            .await
            .unwrap();

        assert_eq!(f.db.bill_count().await, 0);
        assert!(f.db.payments_for_bill(created.bill_id).await.is_empty());
        assert!(f.images.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_divide_existing_bill_once() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let bill = f
            .db
            .seed_bill(f.apartment_id, BillType::Electricity, dec("7.00"))
            .await;

        let undivided = f
            .service
            .list_bills(f.manager_id, f.apartment_id, Some(BillType::Electricity), true)
            .await
            .unwrap();
        assert_eq!(undivided.len(), 1);

        let divided = f
            .service
            .divide_existing(f.manager_id, bill.id)
            .await
            .unwrap();
        assert_eq!(divided.residents_count, 2);

        let mut payments = f.db.payments_for_bill(bill.id).await;
        payments.sort_by_key(|p| p.user_id);
        let lowest = f.manager_id.min(bob);
        assert_eq!(payments[0].user_id, lowest);
        assert_eq!(payments[0].amount.to_string(), "3.50");

        let again = f.service.divide_existing(f.manager_id, bill.id).await;
        assert!(matches!(again, Err(AppError::Conflict(_))));

        let undivided = f
            .service
            .list_bills(f.manager_id, f.apartment_id, None, true)
            .await
            .unwrap();
        assert!(undivided.is_empty());
    }

    #[tokio::test]
    async fn test_non_manager_mutations_leave_store_unchanged() {
        let f = fixture().await;
        let bob = f.resident("bob").await;
        let created = f
            .service
            .create_and_divide(f.manager_id, f.apartment_id, water_bill("10.00"), None)
            .await
            .unwrap();

        assert!(matches!(
            f.service.delete_bill(bob, created.bill_id).await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            f.service
                .create_and_divide(bob, f.apartment_id, water_bill("5.00"), None)
                .await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            f.service.list_bills(bob, f.apartment_id, None, false).await,
            Err(AppError::Forbidden)
        ));

        assert_eq!(f.db.bill_count().await, 1);
        assert_eq!(f.db.payments_for_bill(created.bill_id).await.len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn divided_bill_conserves_total(cents in 1i64..5_000_000, residents in 1usize..12) {
            tokio_test::block_on(async {
                let f = fixture().await;
                for i in 0..residents {
                    f.resident(&format!("resident{}", i)).await;
                }

                let total = money::from_cents(cents);
                let created = f
                    .service
                    .create_and_divide(
                        f.manager_id,
                        f.apartment_id,
                        water_bill(&total.to_string()),
                        None,
                    )
                    .await
                    .unwrap();

                let payments = f.db.payments_for_bill(created.bill_id).await;
                assert_eq!(payments.len(), residents + 1);

                let sum: Decimal = payments.iter().map(|p| p.amount).sum();
                assert_eq!(sum, total);

                let mut users: Vec<i64> = payments.iter().map(|p| p.user_id).collect();
                users.sort_unstable();
                users.dedup();
                assert_eq!(users.len(), payments.len());
            });
        }
    }
}
