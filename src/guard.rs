use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
  Granted,
  Denied,
}

/// Allow-list of Telegram user ids permitted to submit organizations.
#[derive(Debug, Clone)]
pub struct AccessGuard {
  allowed: HashSet<i64>,
}

impl AccessGuard {
  pub fn new(allowed: &[i64]) -> Self {
    Self {
      allowed: allowed.iter().copied().collect(),
    }
  }

  pub fn check(&self, user_id: i64) -> Access {
    if self.allowed.contains(&user_id) {
      Access::Granted
    } else {
      Access::Denied
    }
  }
}
