//! User-facing feedback.
//!
//! Every terminal outcome collapses to one [`Notification`]; the structured
//! cause stays in the logs.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use records::FormKind;
use serde::Serialize;
use uuid::Uuid;

use crate::{error::FormError, pipeline::Receipt};

pub const BETA_SUCCESS: &str =
    "Inscription au programme beta réussie ! Nous vous contacterons bientôt.";
pub const CONTACT_SUCCESS: &str =
    "Message envoyé avec succès ! Notre équipe vous répondra dans les 24h.";
pub const DUPLICATE_EMAIL: &str = "Cette adresse email est déjà inscrite au programme beta.";
pub const DUPLICATE_CONTACT: &str = "Ce message a déjà été envoyé.";
pub const SECURITY_REJECTED: &str = "Activité suspecte détectée. Veuillez réessayer.";
pub const TRY_LATER: &str = "Impossible de soumettre le formulaire. Veuillez réessayer plus tard.";
pub const TECHNICAL_ERROR: &str = "Une erreur technique est survenue. Veuillez réessayer.";
pub const MALFORMED_REQUEST: &str = "Requête invalide.";
pub const LOADING_TEXT: &str = "Envoi en cours...";

pub const DEFAULT_DURATION_MS: u64 = 5000;

pub fn success_message(kind: FormKind) -> &'static str {
    match kind {
        FormKind::Beta => BETA_SUCCESS,
        FormKind::Contact => CONTACT_SUCCESS,
    }
}

pub fn duplicate_message(kind: FormKind) -> &'static str {
    match kind {
        FormKind::Beta => DUPLICATE_EMAIL,
        FormKind::Contact => DUPLICATE_CONTACT,
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
    Warning,
    Info,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: Level,
    pub message: String,
    pub duration_ms: u64,
}

impl Notification {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            duration_ms: DEFAULT_DURATION_MS,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Level::Success, message)
    }

    pub fn for_result(result: &Result<Receipt, FormError>) -> Option<Self> {
        match result {
            Ok(receipt) => Some(Self::success(receipt.message.clone())),
            Err(e) => Self::for_error(e),
        }
    }

    /// None for a cancelled submission, nobody is left to read it.
    pub fn for_error(error: &FormError) -> Option<Self> {
        let notification = match error {
            FormError::Validation(errors) => Self::new(Level::Error, errors.join(". ")),
            FormError::Security(_) => Self::new(Level::Error, SECURITY_REJECTED),
            FormError::Duplicate(message) => Self::new(Level::Warning, message.clone()),
            FormError::Transient(_) => Self::new(Level::Error, TRY_LATER),
            FormError::Terminal(_) => Self::new(Level::Error, TECHNICAL_ERROR),
            FormError::Cancelled => return None,
        };

        Some(notification)
    }
}

/// Stand-in for the page's submit button: one press per (session, form) until
/// the submission resolves.
#[derive(Default, Clone)]
pub struct SubmitButtons {
    pressed: Arc<Mutex<HashSet<(Uuid, FormKind)>>>,
}

impl SubmitButtons {
    pub fn new() -> Self {
        Self::default()
    }

    /// None while the same button is already loading.
    pub fn press(&self, session: Uuid, kind: FormKind) -> Option<Pressed> {
        let inserted = self
            .pressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((session, kind));

        inserted.then(|| Pressed {
            buttons: self.clone(),
            key: (session, kind),
        })
    }

    pub fn is_loading(&self, session: Uuid, kind: FormKind) -> bool {
        self.pressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(session, kind))
    }
}

/// Re-enables the button when dropped.
pub struct Pressed {
    buttons: SubmitButtons,
    key: (Uuid, FormKind),
}

impl Drop for Pressed {
    fn drop(&mut self) {
        self.buttons
            .pressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
