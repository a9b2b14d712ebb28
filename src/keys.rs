//! # Key Types and Comparison
//!
//! Every database declares a key type at creation. Binary keys compare
//! lexicographically; numeric keys are fixed-size little-endian values that
//! compare numerically; custom keys compare through a caller-registered
//! comparator.
//!
//! Key bytes are stored exactly as the caller provides them. For numeric
//! types the stored bytes are the little-endian encoding of the value, so a
//! lexicographic scan of the file is NOT value-ordered for them; ordering is
//! always established through [`compare_keys`].

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::error::ErrorKind;

/// Caller-provided comparator for [`KeyType::Custom`] databases.
pub type CompareFn = dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Binary,
    U8,
    U16,
    U32,
    U64,
    Real32,
    Real64,
    Custom,
}

impl KeyType {
    /// On-disk code stored in the database descriptor.
    pub(crate) fn code(self) -> u16 {
        match self {
            KeyType::Binary => 0,
            KeyType::U8 => 1,
            KeyType::U16 => 2,
            KeyType::U32 => 3,
            KeyType::U64 => 4,
            KeyType::Real32 => 5,
            KeyType::Real64 => 6,
            KeyType::Custom => 7,
        }
    }

    pub(crate) fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => KeyType::Binary,
            1 => KeyType::U8,
            2 => KeyType::U16,
            3 => KeyType::U32,
            4 => KeyType::U64,
            5 => KeyType::Real32,
            6 => KeyType::Real64,
            7 => KeyType::Custom,
            _ => return ErrorKind::IntegrityViolated.raise(),
        })
    }

    /// The mandatory key size for typed keys, `None` for binary/custom.
    pub fn fixed_size(self) -> Option<u16> {
        match self {
            KeyType::U8 => Some(1),
            KeyType::U16 => Some(2),
            KeyType::U32 => Some(4),
            KeyType::U64 => Some(8),
            KeyType::Real32 => Some(4),
            KeyType::Real64 => Some(8),
            KeyType::Binary | KeyType::Custom => None,
        }
    }
}

/// Compares two keys of the given type.
///
/// Numeric keys must already be validated to their fixed size; the slices
/// are decoded little-endian. `Real*` keys use IEEE total ordering so that
/// the comparison is total even for NaN payloads.
pub fn compare_keys(
    kt: KeyType,
    custom: Option<&Arc<CompareFn>>,
    lhs: &[u8],
    rhs: &[u8],
) -> Ordering {
    match kt {
        KeyType::Binary => lhs.cmp(rhs),
        KeyType::U8 => lhs[0].cmp(&rhs[0]),
        KeyType::U16 => {
            let a = u16::from_le_bytes(lhs.try_into().unwrap());
            let b = u16::from_le_bytes(rhs.try_into().unwrap());
            a.cmp(&b)
        }
        KeyType::U32 => {
            let a = u32::from_le_bytes(lhs.try_into().unwrap());
            let b = u32::from_le_bytes(rhs.try_into().unwrap());
            a.cmp(&b)
        }
        KeyType::U64 => {
            let a = u64::from_le_bytes(lhs.try_into().unwrap());
            let b = u64::from_le_bytes(rhs.try_into().unwrap());
            a.cmp(&b)
        }
        KeyType::Real32 => {
            let a = f32::from_le_bytes(lhs.try_into().unwrap());
            let b = f32::from_le_bytes(rhs.try_into().unwrap());
            a.total_cmp(&b)
        }
        KeyType::Real64 => {
            let a = f64::from_le_bytes(lhs.try_into().unwrap());
            let b = f64::from_le_bytes(rhs.try_into().unwrap());
            a.total_cmp(&b)
        }
        KeyType::Custom => match custom {
            Some(f) => f(lhs, rhs),
            // Validated at open; a missing comparator never reaches here.
            None => lhs.cmp(rhs),
        },
    }
}

/// Validates a user key against the database's declared shape.
pub(crate) fn validate_key(kt: KeyType, fixed_size: Option<u16>, key: &[u8]) -> Result<()> {
    if key.len() > u16::MAX as usize {
        return ErrorKind::InvalidParameter.raise();
    }
    if let Some(size) = kt.fixed_size().or(fixed_size) {
        if key.len() != size as usize {
            return ErrorKind::InvalidParameter.raise();
        }
    }
    if key.is_empty() {
        return ErrorKind::InvalidParameter.raise();
    }
    Ok(())
}

/// Encodes a record-number key; the inverse of [`recno_value`].
pub fn recno_key(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

/// Decodes a record-number key.
pub fn recno_value(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| eyre::Report::new(ErrorKind::InvalidParameter))?;
    Ok(u64::from_le_bytes(bytes))
}
