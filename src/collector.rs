//! Linear field collection: one validated answer per step, in form order.

use chrono::DateTime;
use chrono::Utc;

use crate::bot::state::Session;
use crate::form::FieldSpec;
use crate::form::Form;
use crate::models::CompletedRecord;
use crate::models::FieldEntry;
use crate::models::Submitter;
use crate::util::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
  /// The answer was rejected; the session is unchanged.
  Rejected {
    error: ValidationError,
    field: FieldSpec,
  },
  Next {
    session: Session,
    field: FieldSpec,
  },
  Completed(CompletedRecord),
}

/// Field the session is waiting for, `None` once every field is answered.
pub fn current_field<'a>(form: &'a Form, session: &Session) -> Option<&'a FieldSpec> {
  form.field(session.cursor())
}

pub fn advance(form: &Form, mut session: Session, submitter: &Submitter, input: &str, now: DateTime<Utc>) -> Step {
  let Some(field) = current_field(form, &session) else {
    return Step::Completed(complete(form, session, submitter));
  };

  let value = match field.validator.apply(input) {
    Ok(value) => value,
    Err(error) => {
      return Step::Rejected {
        error,
        field: field.clone(),
      };
    },
  };

  session.values.push(value);
  session.touched_at = now;

  match current_field(form, &session) {
    Some(next) => Step::Next {
      field: next.clone(),
      session,
    },
    None => Step::Completed(complete(form, session, submitter)),
  }
}

fn complete(form: &Form, session: Session, submitter: &Submitter) -> CompletedRecord {
  let entries = form
    .fields()
    .iter()
    .zip(session.values)
    .map(|(field, value)| FieldEntry {
      name: field.name.clone(),
      value,
      property: field.property,
    })
    .collect();
  CompletedRecord {
    submitter: submitter.clone(),
    entries,
  }
}
