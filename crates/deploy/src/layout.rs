//! Storage layout descriptors and the upgrade compatibility rule.
//!
//! A layout is the ordered list of a module's persistent fields with their
//! position in storage. Two layouts are upgrade-compatible when every field of
//! the old layout keeps its slot, offset, width and type in the new one, and
//! every new field is placed after the last slot the old layout occupies.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Width of a storage slot in bytes.
pub const SLOT_SIZE: u64 = 32;

/// One persistent field of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageField {
    pub name: String,
    /// Human-readable type label, e.g. `uint256` or `mapping(address => uint256)`.
    pub type_tag: String,
    pub byte_width: u64,
    pub slot: u64,
    /// Byte offset inside `slot` for packed fields.
    pub offset: u64,
}

impl StorageField {
    /// Last slot touched by this field.
    pub fn last_slot(&self) -> u64 {
        let end = self.offset + self.byte_width.max(1);
        self.slot + end.div_ceil(SLOT_SIZE) - 1
    }

    /// Absolute byte position of the first byte of the field.
    fn start_byte(&self) -> u128 {
        self.slot as u128 * SLOT_SIZE as u128 + self.offset as u128
    }

    fn end_byte(&self) -> u128 {
        self.start_byte() + self.byte_width as u128
    }
}

/// Ordered storage layout of a module, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    pub fields: Vec<StorageField>,
}

impl StorageLayout {
    pub fn new(fields: Vec<StorageField>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&StorageField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Last slot occupied by any field, or `None` for an empty layout.
    pub fn last_slot(&self) -> Option<u64> {
        self.fields.iter().map(StorageField::last_slot).max()
    }

    /// Return the first pair of fields sharing storage bytes, if any.
    pub fn find_overlap(&self) -> Option<(&StorageField, &StorageField)> {
        let mut sorted: Vec<&StorageField> = self.fields.iter().collect();
        sorted.sort_by_key(|f| f.start_byte());
        sorted
            .windows(2)
            .find(|pair| pair[0].end_byte() > pair[1].start_byte())
            .map(|pair| (pair[0], pair[1]))
    }
}

/// Reason a new layout cannot replace an old one.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum LayoutViolation {
    #[display("field `{field}` was removed")]
    Removed { field: String },
    #[display("field `{field}` moved from slot {from_slot}+{from_offset} to slot {to_slot}+{to_offset}")]
    Moved {
        field: String,
        from_slot: u64,
        from_offset: u64,
        to_slot: u64,
        to_offset: u64,
    },
    #[display("field `{field}` changed width from {from} to {to} bytes")]
    Resized { field: String, from: u64, to: u64 },
    #[display("field `{field}` changed type from `{from}` to `{to}`")]
    Retyped {
        field: String,
        from: String,
        to: String,
    },
    #[display("new field `{field}` at slot {slot} is not after the last existing slot {last_slot}")]
    NotAppended {
        field: String,
        slot: u64,
        last_slot: u64,
    },
}

/// Check whether `new` may replace `old` behind the same proxy.
///
/// Returns every violation found; an empty list means the layouts are compatible.
pub fn check_compatibility(old: &StorageLayout, new: &StorageLayout) -> Vec<LayoutViolation> {
    let mut violations = Vec::new();

    for existing in &old.fields {
        let Some(candidate) = new.field(&existing.name) else {
            violations.push(LayoutViolation::Removed {
                field: existing.name.clone(),
            });
            continue;
        };

        if candidate.slot != existing.slot || candidate.offset != existing.offset {
            violations.push(LayoutViolation::Moved {
                field: existing.name.clone(),
                from_slot: existing.slot,
                from_offset: existing.offset,
                to_slot: candidate.slot,
                to_offset: candidate.offset,
            });
        }
        if candidate.byte_width != existing.byte_width {
            violations.push(LayoutViolation::Resized {
                field: existing.name.clone(),
                from: existing.byte_width,
                to: candidate.byte_width,
            });
        } else if candidate.type_tag != existing.type_tag {
            violations.push(LayoutViolation::Retyped {
                field: existing.name.clone(),
                from: existing.type_tag.clone(),
                to: candidate.type_tag.clone(),
            });
        }
    }

    if let Some(last_slot) = old.last_slot() {
        for added in new.fields.iter().filter(|f| old.field(&f.name).is_none()) {
            if added.slot <= last_slot {
                violations.push(LayoutViolation::NotAppended {
                    field: added.name.clone(),
                    slot: added.slot,
                    last_slot,
                });
            }
        }
    }

    violations
}
