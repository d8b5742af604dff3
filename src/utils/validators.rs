use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[0-9]{10,15}$").unwrap());

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

static USERNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").unwrap());

static TELEGRAM_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]{5,32}$").unwrap());

pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn validate_phone(phone: &str) -> bool {
    PHONE_REGEX.is_match(phone)
}

pub fn validate_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

pub fn validate_username(username: &str) -> bool {
    USERNAME_REGEX.is_match(username)
}

pub fn is_valid_telegram(username: &str) -> bool {
    TELEGRAM_REGEX.is_match(username)
}

/// Убирает ведущий `@`, пробелы и приводит к нижнему регистру.
pub fn normalize_telegram(username: &str) -> String {
    username.trim().trim_start_matches('@').to_lowercase()
}

/// Дата строго в формате `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

pub fn sanitize_string(input: &str) -> String {
    input.trim().to_string()
}

/// Пустая после обрезки строка считается отсутствующей.
pub fn non_empty(input: Option<String>) -> Option<String> {
    input
        .map(|s| sanitize_string(&s))
        .filter(|s| !s.is_empty())
}
