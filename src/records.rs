//! Reference records an appointment points at. Each is validated when
//! constructed; a value of these types is always well formed.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::limits::*;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} too long (max {max} bytes)")]
    TooLong { field: &'static str, max: usize },
    #[error("invalid email address: {0}")]
    Email(String),
    #[error("invalid phone number: {0}")]
    Phone(String),
    #[error("size must be a positive number of m², got {0}")]
    Size(f64),
    #[error("{0} rate out of range")]
    Rate(&'static str),
    #[error("unknown furnishing: {0}")]
    Furnishing(String),
}

fn require_text(field: &'static str, value: &str, max: usize) -> Result<String, RecordError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RecordError::Empty(field));
    }
    if value.len() > max {
        return Err(RecordError::TooLong { field, max });
    }
    Ok(value.to_string())
}

/// `local@domain.tld`, no whitespace, no empty labels.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Strip formatting and keep the digits; 8 to 15 of them (E.164 length).
pub fn normalize_phone(phone: &str) -> Result<String, RecordError> {
    if phone
        .chars()
        .any(|c| !(c.is_ascii_digit() || " +-().".contains(c)))
    {
        return Err(RecordError::Phone(phone.to_string()));
    }
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if !(8..=15).contains(&digits.len()) {
        return Err(RecordError::Phone(phone.to_string()));
    }
    Ok(digits)
}

// ── Client ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    id: Ulid,
    name: String,
    email: String,
    phone: Option<String>,
}

impl Client {
    pub fn new(
        id: Ulid,
        name: &str,
        email: &str,
        phone: Option<&str>,
    ) -> Result<Self, RecordError> {
        let name = require_text("name", name, MAX_NAME_LEN)?;
        let email = require_text("email", email, MAX_EMAIL_LEN)?.to_ascii_lowercase();
        if !is_valid_email(&email) {
            return Err(RecordError::Email(email));
        }
        let phone = match phone.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => Some(normalize_phone(p)?),
            None => None,
        };
        Ok(Self {
            id,
            name,
            email,
            phone,
        })
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

// ── Agency ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Furnishing {
    Unfurnished,
    SemiFurnished,
    Furnished,
}

impl Furnishing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Furnishing::Unfurnished => "unfurnished",
            Furnishing::SemiFurnished => "semi_furnished",
            Furnishing::Furnished => "furnished",
        }
    }
}

impl FromStr for Furnishing {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unfurnished" => Ok(Furnishing::Unfurnished),
            "semi_furnished" | "semi-furnished" | "semifurnished" => Ok(Furnishing::SemiFurnished),
            "furnished" => Ok(Furnishing::Furnished),
            other => Err(RecordError::Furnishing(other.to_string())),
        }
    }
}

/// Per-m² prices in cents, by furnishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub unfurnished: i64,
    pub semi_furnished: i64,
    pub furnished: i64,
}

impl Rates {
    pub fn rate_for(&self, furnishing: Furnishing) -> i64 {
        match furnishing {
            Furnishing::Unfurnished => self.unfurnished,
            Furnishing::SemiFurnished => self.semi_furnished,
            Furnishing::Furnished => self.furnished,
        }
    }

    fn validate(&self) -> Result<(), RecordError> {
        for (label, rate) in [
            ("unfurnished", self.unfurnished),
            ("semi_furnished", self.semi_furnished),
            ("furnished", self.furnished),
        ] {
            if !(0..=MAX_RATE_CENTS).contains(&rate) {
                return Err(RecordError::Rate(label));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    id: Ulid,
    name: String,
    rates: Rates,
}

impl Agency {
    pub fn new(id: Ulid, name: &str, rates: Rates) -> Result<Self, RecordError> {
        let name = require_text("name", name, MAX_NAME_LEN)?;
        rates.validate()?;
        Ok(Self { id, name, rates })
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rates(&self) -> &Rates {
        &self.rates
    }
}

// ── Property ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    id: Ulid,
    code: String,
    client_id: Ulid,
    agency_id: Ulid,
    address: String,
    size_m2: f64,
    furnishing: Furnishing,
}

impl Property {
    pub fn new(
        id: Ulid,
        code: &str,
        client_id: Ulid,
        agency_id: Ulid,
        address: &str,
        size_m2: f64,
        furnishing: Furnishing,
    ) -> Result<Self, RecordError> {
        let code = require_text("code", code, MAX_CODE_LEN)?;
        let address = require_text("address", address, MAX_ADDRESS_LEN)?;
        if !size_m2.is_finite() || size_m2 <= 0.0 || size_m2 > MAX_SIZE_M2 {
            return Err(RecordError::Size(size_m2));
        }
        Ok(Self {
            id,
            code,
            client_id,
            agency_id,
            address,
            size_m2,
            furnishing,
        })
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn client_id(&self) -> Ulid {
        self.client_id
    }

    pub fn agency_id(&self) -> Ulid {
        self.agency_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn size_m2(&self) -> f64 {
        self.size_m2
    }

    pub fn furnishing(&self) -> Furnishing {
        self.furnishing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> Rates {
        Rates {
            unfurnished: 300,
            semi_furnished: 350,
            furnished: 400,
        }
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("ana@example.com"));
        assert!(is_valid_email("a.b+c@mail.example.com.br"));
        assert!(!is_valid_email("ana"));
        assert!(!is_valid_email("ana@"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ana@example"));
        assert!(!is_valid_email("ana@@example.com"));
        assert!(!is_valid_email("ana@exa mple.com"));
        assert!(!is_valid_email("ana@example..com"));
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(11) 98765-4321").unwrap(), "11987654321");
        assert_eq!(normalize_phone("+55 11 3333 4444").unwrap(), "551133334444");
        assert!(normalize_phone("1234").is_err());
        assert!(normalize_phone("call me").is_err());
    }

    #[test]
    fn client_trims_and_lowercases() {
        let c = Client::new(Ulid::new(), "  Ana Souza ", "Ana@Example.COM", Some("")).unwrap();
        assert_eq!(c.name(), "Ana Souza");
        assert_eq!(c.email(), "ana@example.com");
        assert_eq!(c.phone(), None);
    }

    #[test]
    fn client_rejects_bad_fields() {
        assert_eq!(
            Client::new(Ulid::new(), " ", "a@b.co", None),
            Err(RecordError::Empty("name"))
        );
        assert!(matches!(
            Client::new(Ulid::new(), "Ana", "nope", None),
            Err(RecordError::Email(_))
        ));
        assert!(matches!(
            Client::new(Ulid::new(), "Ana", "a@b.co", Some("12")),
            Err(RecordError::Phone(_))
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            Client::new(Ulid::new(), &long, "a@b.co", None),
            Err(RecordError::TooLong { field: "name", .. })
        ));
    }

    #[test]
    fn agency_rejects_negative_rate() {
        let mut r = rates();
        r.semi_furnished = -1;
        assert_eq!(
            Agency::new(Ulid::new(), "Imobiliária Sol", r),
            Err(RecordError::Rate("semi_furnished"))
        );
        let a = Agency::new(Ulid::new(), "Imobiliária Sol", rates()).unwrap();
        assert_eq!(a.rates().rate_for(Furnishing::Furnished), 400);
    }

    #[test]
    fn property_rejects_bad_size() {
        let make = |size: f64| {
            Property::new(
                Ulid::new(),
                "AP-101",
                Ulid::new(),
                Ulid::new(),
                "Rua A, 10",
                size,
                Furnishing::Furnished,
            )
        };
        assert!(make(72.5).is_ok());
        assert_eq!(make(0.0), Err(RecordError::Size(0.0)));
        assert!(matches!(make(-3.0), Err(RecordError::Size(_))));
        assert!(matches!(make(f64::NAN), Err(RecordError::Size(_))));
        assert!(matches!(make(MAX_SIZE_M2 + 1.0), Err(RecordError::Size(_))));
    }

    #[test]
    fn furnishing_parsing() {
        assert_eq!("furnished".parse::<Furnishing>(), Ok(Furnishing::Furnished));
        assert_eq!("Semi-Furnished".parse::<Furnishing>(), Ok(Furnishing::SemiFurnished));
        assert!("palace".parse::<Furnishing>().is_err());
    }
}
