use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use app_error::AppError;
use database::pg_row::GrantFlags;
use serde::{Deserialize, Serialize};

/// Represents the actions that can be performed on a file or folder.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
  Read,
  Write,
  Delete,
  Share,
}

impl Capability {
  pub const ALL: [Capability; 4] = [
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Share,
  ];

  fn bit(&self) -> u8 {
    match self {
      Capability::Read => 1,
      Capability::Write => 1 << 1,
      Capability::Delete => 1 << 2,
      Capability::Share => 1 << 3,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Capability::Read => "read",
      Capability::Write => "write",
      Capability::Delete => "delete",
      Capability::Share => "share",
    }
  }
}

impl PartialOrd for Capability {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Capability {
  fn cmp(&self, other: &Self) -> Ordering {
    self.bit().cmp(&other.bit())
  }
}

impl Display for Capability {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Capability {
  type Err = AppError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "read" => Ok(Capability::Read),
      "write" => Ok(Capability::Write),
      "delete" => Ok(Capability::Delete),
      "share" => Ok(Capability::Share),
      other => Err(AppError::InvalidRequest(format!(
        "unknown capability: {}",
        other
      ))),
    }
  }
}

/// A fixed bit-set over [Capability]. Combining two sets is always a union.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
  pub const fn empty() -> Self {
    Self(0)
  }

  pub fn all() -> Self {
    Capability::ALL.into_iter().collect()
  }

  pub fn contains(&self, capability: Capability) -> bool {
    self.0 & capability.bit() != 0
  }

  pub fn insert(&mut self, capability: Capability) {
    self.0 |= capability.bit();
  }

  pub fn union(&self, other: CapabilitySet) -> CapabilitySet {
    CapabilitySet(self.0 | other.0)
  }

  pub fn is_empty(&self) -> bool {
    self.0 == 0
  }

  pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
    Capability::ALL.into_iter().filter(|cap| self.contains(*cap))
  }
}

impl From<Capability> for CapabilitySet {
  fn from(value: Capability) -> Self {
    CapabilitySet(value.bit())
  }
}

impl FromIterator<Capability> for CapabilitySet {
  fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
    let mut set = CapabilitySet::empty();
    for cap in iter {
      set.insert(cap);
    }
    set
  }
}

impl std::ops::BitOr for CapabilitySet {
  type Output = CapabilitySet;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.union(rhs)
  }
}

impl std::ops::BitOrAssign for CapabilitySet {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.union(rhs);
  }
}

impl From<GrantFlags> for CapabilitySet {
  fn from(flags: GrantFlags) -> Self {
    let mut set = CapabilitySet::empty();
    if flags.can_read {
      set.insert(Capability::Read);
    }
    if flags.can_write {
      set.insert(Capability::Write);
    }
    if flags.can_delete {
      set.insert(Capability::Delete);
    }
    if flags.can_share {
      set.insert(Capability::Share);
    }
    set
  }
}

impl From<CapabilitySet> for GrantFlags {
  fn from(set: CapabilitySet) -> Self {
    GrantFlags {
      can_read: set.contains(Capability::Read),
      can_write: set.contains(Capability::Write),
      can_delete: set.contains(Capability::Delete),
      can_share: set.contains(Capability::Share),
    }
  }
}

impl Display for CapabilitySet {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.is_empty() {
      return f.write_str("none");
    }
    let names = self.iter().map(|cap| cap.as_str()).collect::<Vec<_>>();
    f.write_str(&names.join("|"))
  }
}
