//! Persisted kill switch.
//!
//! The record in the state store is the sole authority for the trading gate.
//! Reads fail closed: a missing, unreadable or corrupt record reports the
//! switch as active. Only `deactivate` clears it.

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use claw_common::KillSwitchState;

use crate::store::{records, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error("Kill switch record unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Handle to the persisted kill switch.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    store: StateStore,
}

impl KillSwitch {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Activate with `reason`. Re-activation overwrites reason and timestamp.
    pub fn activate(&self, reason: &str) -> Result<KillSwitchState, KillSwitchError> {
        let state = KillSwitchState::active(reason, Utc::now());
        self.store.files().write(records::KILL_SWITCH, &state)?;
        error!(reason, "KILL SWITCH ACTIVATED");
        Ok(state)
    }

    /// Reset to inactive. The only way out of the active state.
    pub fn deactivate(&self) -> Result<(), KillSwitchError> {
        self.store
            .files()
            .write(records::KILL_SWITCH, &KillSwitchState::inactive())?;
        info!("Kill switch deactivated");
        Ok(())
    }

    /// Whether trading is halted. Never errors: any failure reads as active.
    pub fn is_active(&self) -> bool {
        match self.store.files().read::<KillSwitchState>(records::KILL_SWITCH) {
            Ok(Some(v)) => v.data.enabled,
            Ok(None) => {
                warn!("Kill switch record missing, treating as active");
                true
            }
            Err(e) => {
                warn!(error = %e, "Kill switch record unreadable, treating as active");
                true
            }
        }
    }

    /// The stored record, `None` when it has never been written.
    pub fn status(&self) -> Result<Option<KillSwitchState>, KillSwitchError> {
        Ok(self
            .store
            .files()
            .read::<KillSwitchState>(records::KILL_SWITCH)?
            .map(|v| v.data))
    }
}
