use crate::error::{
    ChainError,
    ChainResult,
};

use parking_lot::RwLock;

use std::fmt::Debug;

/// A cache cell for ledger values that never change once they are known.
///
/// Setting the same value again is a no-op. Setting a different value means the ledger
/// contradicted an earlier read and is reported as [`ChainError::Internal`].
#[derive(Debug)]
pub struct WriteOnce<T> {
    value: RwLock<Option<T>>,
}

impl<T> Default for WriteOnce<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }
}

impl<T: Clone + PartialEq + Debug> WriteOnce<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(value: T) -> Self {
        Self {
            value: RwLock::new(Some(value)),
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value.read().clone()
    }

    pub fn set(&self, value: T) -> ChainResult<T> {
        let mut slot = self.value.write();
        match slot.as_ref() {
            Some(existing) if *existing != value => {
                Err(ChainError::Internal(format!(
                    "cached value {existing:?} contradicted by {value:?}"
                )))
            }
            Some(existing) => Ok(existing.clone()),
            None => {
                *slot = Some(value.clone());
                Ok(value)
            }
        }
    }
}

impl<T: Clone> Clone for WriteOnce<T> {
    fn clone(&self) -> Self {
        Self {
            value: RwLock::new(self.value.read().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_once() {
        let cell = WriteOnce::new();
        assert_eq!(cell.get(), None);
        assert_eq!(cell.set(5u64).unwrap(), 5);
        assert_eq!(cell.set(5u64).unwrap(), 5);
        assert_eq!(cell.get(), Some(5));
    }

    #[test]
    fn test_differing_overwrite_rejected() {
        let cell = WriteOnce::known(true);
        assert!(matches!(cell.set(false), Err(ChainError::Internal(_))));
        assert_eq!(cell.get(), Some(true));
    }
}
