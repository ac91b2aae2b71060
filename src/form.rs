use std::collections::HashSet;

use thiserror::Error;

use crate::models::PropertyKind;
use crate::util;
use crate::util::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
  NonEmpty,
  CompanyName,
  OneOf(Vec<String>),
  GoogleMapsLink,
  Phone,
}

impl Validator {
  pub fn apply(&self, input: &str) -> Result<String, ValidationError> {
    match self {
      Self::NonEmpty => util::require_text(input).map(str::to_string),
      Self::CompanyName => util::validate_company_name(input),
      Self::OneOf(choices) => util::match_choice(input, choices),
      Self::GoogleMapsLink => util::validate_maps_link(input),
      Self::Phone => util::normalize_phone(input),
    }
  }
}

/// One required field: its Notion column, the question asked and how the answer is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
  pub name: String,
  pub prompt: String,
  pub validator: Validator,
  pub property: PropertyKind,
}

impl FieldSpec {
  pub fn text(name: &str, prompt: &str) -> Self {
    Self {
      name: name.to_string(),
      prompt: prompt.to_string(),
      validator: Validator::NonEmpty,
      property: PropertyKind::RichText,
    }
  }

  pub fn with_validator(mut self, validator: Validator) -> Self {
    self.validator = validator;
    self
  }

  pub fn with_property(mut self, property: PropertyKind) -> Self {
    self.property = property;
    self
  }

  pub fn choices(&self) -> Option<&[String]> {
    match &self.validator {
      Validator::OneOf(choices) => Some(choices),
      _ => None,
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
  #[error("form needs at least one field")]
  NoFields,
  #[error("field {0:?} appears more than once")]
  DuplicateField(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
  fields: Vec<FieldSpec>,
}

impl Form {
  /// Field names double as Notion property names, so they must be unique.
  pub fn new(fields: Vec<FieldSpec>) -> Result<Self, FormError> {
    if fields.is_empty() {
      return Err(FormError::NoFields);
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = fields.iter().find(|field| !seen.insert(field.name.as_str())) {
      return Err(FormError::DuplicateField(duplicate.name.clone()));
    }
    Ok(Self { fields })
  }

  /// The organization card kept in the Notion database.
  pub fn organization() -> Result<Self, FormError> {
    let place_types = ["Places to eat", "Adventures", "Services"]
      .into_iter()
      .map(str::to_string)
      .collect();
    Self::new(vec![
      FieldSpec::text("Name", "🏢 Enter the organization name:")
        .with_validator(Validator::CompanyName)
        .with_property(PropertyKind::Title),
      FieldSpec::text("Type", "🗂️ Choose the organization type:")
        .with_validator(Validator::OneOf(place_types))
        .with_property(PropertyKind::Select),
      FieldSpec::text("Location", "📍 Enter the town or area:").with_property(PropertyKind::Select),
      FieldSpec::text("Google Map", "🗺️ Send the Google Maps link (https://maps.app.goo.gl/...):")
        .with_validator(Validator::GoogleMapsLink)
        .with_property(PropertyKind::Url),
      FieldSpec::text("Phone Number", "📞 Enter the phone number:").with_validator(Validator::Phone),
      FieldSpec::text("WhatsApp Number", "💬 Enter the WhatsApp number:").with_validator(Validator::Phone),
      FieldSpec::text("Hours of Operation", "🕒 Enter the hours of operation:"),
      FieldSpec::text("Owner / Manager", "👤 Enter the owner or manager phone number:")
        .with_validator(Validator::Phone),
    ])
  }

  pub fn field(&self, index: usize) -> Option<&FieldSpec> {
    self.fields.get(index)
  }

  pub fn fields(&self) -> &[FieldSpec] {
    &self.fields
  }

  pub fn position(&self, name: &str) -> Option<usize> {
    self
      .fields
      .iter()
      .position(|field| field.name.eq_ignore_ascii_case(name.trim()))
  }

  /// The field stored as the Notion page title, used to look records up.
  pub fn title_field(&self) -> &FieldSpec {
    self
      .fields
      .iter()
      .find(|field| field.property == PropertyKind::Title)
      .unwrap_or(&self.fields[0])
  }
}
