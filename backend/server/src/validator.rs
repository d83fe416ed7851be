//! Field rules for both forms.
//!
//! Every rule runs; errors come back in field order so the page can show all of
//! them at once.
use std::sync::LazyLock;

use records::{FormKind, Profile};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::char_len;

pub const NAME_MIN: usize = 2;
pub const MESSAGE_MIN: usize = 10;
pub const MESSAGE_MAX: usize = 5000;
pub const EXPECTATIONS_MAX: usize = 1000;
pub const REPEATED_RUN: usize = 5;

pub const DISPOSABLE_DOMAINS: [&str; 8] = [
    "tempmail",
    "10minutemail",
    "guerrillamail",
    "mailinator",
    "throwaway",
    "temp-mail",
    "fakemailgenerator",
    "yopmail",
];

pub const NAME_TOO_SHORT: &str = "Le nom doit contenir au moins 2 caractères";
pub const NAME_CHARSET: &str = "Le nom ne peut contenir que des lettres";
pub const EMAIL_INVALID: &str = "Une adresse email valide est requise";
pub const EMAIL_DISPOSABLE: &str = "Domaine email non autorisé";
pub const EMAIL_SUSPICIOUS: &str = "Format d'email suspect";
pub const PROFILE_INVALID: &str = "Veuillez sélectionner un profil valide";
pub const EXPECTATIONS_TOO_LONG: &str = "Les attentes ne peuvent pas dépasser 1000 caractères";
pub const SUBJECT_MISSING: &str = "Veuillez sélectionner un sujet";
pub const MESSAGE_TOO_SHORT: &str = "Le message doit contenir au moins 10 caractères";
pub const MESSAGE_TOO_LONG: &str = "Le message ne peut pas dépasser 5000 caractères";

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-ZÀ-ÿ\s'-]+$").expect("name pattern"));
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern"));

/// Raw form fields as posted, before normalization.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RawFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub profile: Option<String>,
    pub expectations: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

pub fn validate(kind: FormKind, fields: &RawFields) -> ValidationResult {
    let mut errors = Vec::new();

    check_name(&fields.name, &mut errors);
    check_email(&fields.email, &mut errors);

    match kind {
        FormKind::Beta => {
            let profile = fields.profile.as_deref().map(str::trim).unwrap_or_default();
            if profile.parse::<Profile>().is_err() {
                errors.push(PROFILE_INVALID.to_string());
            }

            if let Some(expectations) = &fields.expectations {
                if char_len(expectations.trim()) > EXPECTATIONS_MAX {
                    errors.push(EXPECTATIONS_TOO_LONG.to_string());
                }
            }
        }
        FormKind::Contact => {
            let subject = fields.subject.as_deref().map(str::trim).unwrap_or_default();
            if subject.is_empty() {
                errors.push(SUBJECT_MISSING.to_string());
            }

            let message = fields.message.as_deref().map(str::trim).unwrap_or_default();
            let length = char_len(message);
            if length < MESSAGE_MIN {
                errors.push(MESSAGE_TOO_SHORT.to_string());
            } else if length > MESSAGE_MAX {
                errors.push(MESSAGE_TOO_LONG.to_string());
            }
        }
    }

    ValidationResult::from_errors(errors)
}

fn check_name(name: &str, errors: &mut Vec<String>) {
    let name = name.trim();

    if char_len(name) < NAME_MIN {
        errors.push(NAME_TOO_SHORT.to_string());
    } else if !NAME.is_match(name) {
        errors.push(NAME_CHARSET.to_string());
    }
}

fn check_email(email: &str, errors: &mut Vec<String>) {
    let email = email.trim();

    if !EMAIL.is_match(email) {
        errors.push(EMAIL_INVALID.to_string());
        return;
    }

    if is_disposable(email) {
        errors.push(EMAIL_DISPOSABLE.to_string());
    }

    if has_repeated_run(email, REPEATED_RUN) {
        errors.push(EMAIL_SUSPICIOUS.to_string());
    }
}

pub fn is_disposable(email: &str) -> bool {
    let Some((_, domain)) = email.split_once('@') else {
        return false;
    };
    let domain = domain.to_lowercase();

    DISPOSABLE_DOMAINS.iter().any(|d| domain.contains(d))
}

/// True when some character repeats at least `run` times in a row.
pub fn has_repeated_run(s: &str, run: usize) -> bool {
    let mut previous = None;
    let mut count = 0;

    for c in s.chars() {
        if Some(c) == previous {
            count += 1;
        } else {
            previous = Some(c);
            count = 1;
        }

        if count >= run {
            return true;
        }
    }

    false
}
