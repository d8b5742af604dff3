use rust_decimal::{Decimal, RoundingStrategy};

/// Доля одного плательщика в счёте.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub user_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// Базовая доля без остатка
    pub per_person: Decimal,
    pub shares: Vec<Share>,
}

/// Приводит сумму к двум знакам (банковское округление).
pub fn normalize(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(2);
    rounded
}

pub fn to_cents(amount: Decimal) -> Option<i64> {
    i64::try_from(normalize(amount).mantissa()).ok()
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Наибольшая сумма, которую вмещает колонка `NUMERIC(12, 2)`.
pub fn max_amount() -> Decimal {
    from_cents(999_999_999_999)
}

pub fn zero() -> Decimal {
    from_cents(0)
}

/// Делит сумму поровну в копейках. Остаток целиком достаётся участнику
/// с наименьшим `user_id`, поэтому сумма долей всегда равна `total`.
///
/// Возвращает `None` для пустого списка или неположительной суммы.
pub fn split_evenly(total: Decimal, user_ids: &[i64]) -> Option<Split> {
    let cents = to_cents(total)?;
    if cents <= 0 || user_ids.is_empty() {
        return None;
    }

    let mut ordered = user_ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();

    let count = ordered.len() as i64;
    let base = cents / count;
    let residual = cents - base * count;

    let shares = ordered
        .iter()
        .enumerate()
        .map(|(index, &user_id)| {
            let extra = if index == 0 { residual } else { 0 };
            Share {
                user_id,
                amount: from_cents(base + extra),
            }
        })
        .collect();

    Some(Split {
        per_person: from_cents(base),
        shares,
    })
}
