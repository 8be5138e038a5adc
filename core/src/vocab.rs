//! Token-id layout shared by the table, the streams and the model.
//!
//! ```text
//! [0, m)          originals
//! [m, 2m)         aliases (same values, offset by m)
//! 2m + {0,1,2,3}  equal, true, false, define
//! ```

use serde::{Serialize, Deserialize};
use crate::error::ConfigError;

/// Number of special tokens appended after the alias range.
pub const NUM_SPECIALS: usize = 4;

/// Special tokens, valued by their offset past the alias range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Special {
    Equal = 0,
    True = 1,
    False = 2,
    Define = 3,
}

/// Which copy of the value range a token id lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Original(usize),
    Alias(usize),
    Special(Special),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocab {
    modulus: usize,
}

impl Vocab {
    pub fn new(modulus: usize) -> Result<Self, ConfigError> {
        if modulus == 0 {
            return Err(ConfigError::ZeroModulus);
        }
        Ok(Vocab { modulus })
    }

    pub fn modulus(&self) -> usize {
        self.modulus
    }

    /// Total vocabulary size: `2 * mod + 4`.
    pub fn size(&self) -> usize {
        2 * self.modulus + NUM_SPECIALS
    }

    pub fn original(&self, value: usize) -> usize {
        debug_assert!(value < self.modulus);
        value
    }

    pub fn alias(&self, value: usize) -> usize {
        debug_assert!(value < self.modulus);
        value + self.modulus
    }

    pub fn special(&self, s: Special) -> usize {
        2 * self.modulus + s as usize
    }

    pub fn kind(&self, id: usize) -> Option<TokenKind> {
        let m = self.modulus;
        match id {
            _ if id < m => Some(TokenKind::Original(id)),
            _ if id < 2 * m => Some(TokenKind::Alias(id - m)),
            _ => match id - 2 * m {
                0 => Some(TokenKind::Special(Special::Equal)),
                1 => Some(TokenKind::Special(Special::True)),
                2 => Some(TokenKind::Special(Special::False)),
                3 => Some(TokenKind::Special(Special::Define)),
                _ => None,
            },
        }
    }
}
