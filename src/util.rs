use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Notion rejects rich text content longer than this.
pub const MAX_VALUE_CHARS: usize = 2000;

static COMPANY_NAME_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[\p{L}\p{N}\s.,:;!?'&-]+$").expect("valid regex"));
static SHORT_MAPS_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^https://maps\.app\.goo\.gl/[A-Za-z0-9]+$").expect("valid regex"));
static FULL_MAPS_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^https://(?:www\.)?google\.[a-z.]{2,6}/maps/\S+$").expect("valid regex"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
  #[error("value must not be empty")]
  Empty,
  #[error("value exceeds {} characters", MAX_VALUE_CHARS)]
  TooLong,
  #[error("name contains unsupported characters")]
  InvalidName,
  #[error("value must be one of: {}", .0.join(", "))]
  NotAChoice(Vec<String>),
  #[error("expected a Google Maps link")]
  InvalidMapsLink,
  #[error("phone number needs at least 7 digits")]
  InvalidPhone,
}

impl ValidationError {
  pub fn user_message(&self) -> String {
    match self {
      Self::Empty => "⚠️ This field cannot be empty.".to_string(),
      Self::TooLong => format!("⚠️ Please keep it under {MAX_VALUE_CHARS} characters."),
      Self::InvalidName => {
        "⚠️ Invalid name. Use letters, digits, spaces and basic punctuation only.".to_string()
      },
      Self::NotAChoice(choices) => format!("⚠️ Please choose one of: {}.", choices.join(", ")),
      Self::InvalidMapsLink => {
        "⚠️ Invalid link. Share it from Google Maps, e.g. https://maps.app.goo.gl/AbC123.".to_string()
      },
      Self::InvalidPhone => "⚠️ Invalid phone number. Send at least 7 digits.".to_string(),
    }
  }
}

/// Trims the input and enforces the rules every field shares.
pub fn require_text(input: &str) -> Result<&str, ValidationError> {
  let trimmed = input.trim();
  if trimmed.is_empty() {
    return Err(ValidationError::Empty);
  }
  if trimmed.chars().count() > MAX_VALUE_CHARS {
    return Err(ValidationError::TooLong);
  }
  Ok(trimmed)
}

pub fn validate_company_name(input: &str) -> Result<String, ValidationError> {
  let name = require_text(input)?;
  if !COMPANY_NAME_PATTERN.is_match(name) {
    return Err(ValidationError::InvalidName);
  }
  Ok(name.to_string())
}

pub fn match_choice(input: &str, choices: &[String]) -> Result<String, ValidationError> {
  let value = require_text(input)?;
  choices
    .iter()
    .find(|choice| choice.eq_ignore_ascii_case(value))
    .cloned()
    .ok_or_else(|| ValidationError::NotAChoice(choices.to_vec()))
}

pub fn validate_maps_link(input: &str) -> Result<String, ValidationError> {
  let link = require_text(input)?;
  if SHORT_MAPS_PATTERN.is_match(link) || FULL_MAPS_PATTERN.is_match(link) {
    Ok(link.to_string())
  } else {
    Err(ValidationError::InvalidMapsLink)
  }
}

/// Keeps the digits and adds the Costa Rica country code to local numbers.
pub fn normalize_phone(input: &str) -> Result<String, ValidationError> {
  let raw = require_text(input)?;
  let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
  if digits.len() < 7 {
    return Err(ValidationError::InvalidPhone);
  }
  let normalized = match digits.len() {
    8 => format!("+506{digits}"),
    11 if digits.starts_with("506") => format!("+{digits}"),
    _ => digits,
  };
  Ok(normalized)
}
