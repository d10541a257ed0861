use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{ValidationError, Violation};
use crate::models::User;

// ============================================================================
// Record Validation
// ============================================================================
//
// Validators are pure: no I/O, no shared mutable state. Anything
// time-dependent reads an injected clock so results are reproducible.
//
// ============================================================================

pub trait Validator<T>: Send + Sync {
    fn validate(&self, record: &T) -> Result<(), ValidationError>;
}

static ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));
static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("valid regex")
});
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]{5,16}[0-9]$").expect("valid regex"));

static EARLIEST_BIRTH: LazyLock<DateTime<Utc>> = LazyLock::new(|| {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
        .single()
        .expect("valid date")
});

const MAX_ID: usize = 40;
const MAX_USERNAME: usize = 100;
const MAX_EMAIL: usize = 100;
const MAX_PHONE: usize = 18;

pub struct UserValidator {
    clock: fn() -> DateTime<Utc>,
}

impl Default for UserValidator {
    fn default() -> Self {
        Self { clock: Utc::now }
    }
}

impl UserValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }
}

fn required(violations: &mut Vec<Violation>, field: &str, value: &str) -> bool {
    if value.trim().is_empty() {
        violations.push(Violation::new(field, "required", format!("{field} is required")));
        false
    } else {
        true
    }
}

fn max_len(violations: &mut Vec<Violation>, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        violations.push(
            Violation::new(field, "max", format!("{field} must be at most {max} characters"))
                .with_param(max.to_string()),
        );
    }
}

fn pattern(violations: &mut Vec<Violation>, field: &str, value: &str, re: &Regex, code: &str) {
    if !re.is_match(value) {
        violations.push(Violation::new(field, code, format!("{field} has an invalid format")));
    }
}

impl Validator<User> for UserValidator {
    fn validate(&self, user: &User) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        if required(&mut violations, "id", &user.id) {
            max_len(&mut violations, "id", &user.id, MAX_ID);
            pattern(&mut violations, "id", &user.id, &ID, "pattern");
        }

        if required(&mut violations, "username", &user.username) {
            max_len(&mut violations, "username", &user.username, MAX_USERNAME);
            pattern(&mut violations, "username", &user.username, &USERNAME, "username");
        }

        if let Some(email) = user.email.as_deref().filter(|e| !e.is_empty()) {
            max_len(&mut violations, "email", email, MAX_EMAIL);
            pattern(&mut violations, "email", email, &EMAIL, "email");
        }

        if required(&mut violations, "phone", &user.phone) {
            max_len(&mut violations, "phone", &user.phone, MAX_PHONE);
            pattern(&mut violations, "phone", &user.phone, &PHONE, "phone");
        }

        if let Some(dob) = user.date_of_birth {
            if dob > (self.clock)() {
                violations.push(Violation::new(
                    "dateOfBirth",
                    "past",
                    "dateOfBirth must not be in the future",
                ));
            } else if dob < *EARLIEST_BIRTH {
                violations.push(
                    Violation::new("dateOfBirth", "min", "dateOfBirth is before 1900-01-01")
                        .with_param("1900-01-01"),
                );
            }
        }

        match ValidationError::from_violations(violations) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
