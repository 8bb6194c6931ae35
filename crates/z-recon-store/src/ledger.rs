//! Reservation bookkeeping shared by the backends.

use std::collections::BTreeSet;

use z_recon_core::IdempotencyKey;

use crate::error::{Result, StoreError};

/// Tracks `Fresh` reservations made inside one unit of work.
#[derive(Debug, Default)]
pub(crate) struct Reservations {
    open: BTreeSet<IdempotencyKey>,
    completed: BTreeSet<IdempotencyKey>,
}

impl Reservations {
    pub(crate) fn reserve(&mut self, key: &IdempotencyKey) {
        self.open.insert(key.clone());
    }

    pub(crate) fn complete(&mut self, key: &IdempotencyKey) -> Result<()> {
        if !self.open.remove(key) || !self.completed.insert(key.clone()) {
            return Err(StoreError::NotReserved(key.to_string()));
        }
        Ok(())
    }

    /// Fails when a reservation was left open.
    pub(crate) fn finish(&self) -> Result<()> {
        match self.open.first() {
            Some(key) => Err(StoreError::ReservationNotCompleted(key.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z_recon_core::Provider;

    #[test]
    fn reserve_then_complete() {
        let key = IdempotencyKey::new(Provider::Lago, "abc");
        let mut r = Reservations::default();
        r.reserve(&key);
        assert!(r.finish().is_err());
        r.complete(&key).unwrap();
        r.finish().unwrap();
        assert!(matches!(r.complete(&key), Err(StoreError::NotReserved(_))));
    }

    #[test]
    fn complete_without_reserve_fails() {
        let mut r = Reservations::default();
        let key = IdempotencyKey::new(Provider::Stripe, "evt_1");
        assert!(matches!(r.complete(&key), Err(StoreError::NotReserved(_))));
    }
}
