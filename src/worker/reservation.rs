//! Fixed namespace of reservable worker names.

use super::record::WorkerId;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A name that at most one live worker may hold at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reservation {
    // Process names
    BridgeCommunication,
    InternalExecution,
    InternalUi,
    ExternalExecution,
    ExternalUi,
    ExternalStateManager,
    DeveloperWindow,
    // Thread names
    BridgeThread,
    InternalStationThread,
    ExternalStationThread,
}

impl Reservation {
    pub const ALL: [Reservation; 10] = [
        Reservation::BridgeCommunication,
        Reservation::InternalExecution,
        Reservation::InternalUi,
        Reservation::ExternalExecution,
        Reservation::ExternalUi,
        Reservation::ExternalStateManager,
        Reservation::DeveloperWindow,
        Reservation::BridgeThread,
        Reservation::InternalStationThread,
        Reservation::ExternalStationThread,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Reservation::BridgeCommunication => "bridge_communication",
            Reservation::InternalExecution => "internal_execution",
            Reservation::InternalUi => "internal_ui",
            Reservation::ExternalExecution => "external_execution",
            Reservation::ExternalUi => "external_ui",
            Reservation::ExternalStateManager => "external_state_manager",
            Reservation::DeveloperWindow => "developer_window",
            Reservation::BridgeThread => "bridge_thread",
            Reservation::InternalStationThread => "internal_station_thread",
            Reservation::ExternalStationThread => "external_station_thread",
        }
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reservation {
    type Err = Error;

    /// Accepts both `snake_case` and `kebab-case` spellings.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Reservation::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| Error::UnknownReservation(s.to_string()))
    }
}

/// Currently held reservations of one manager.
#[derive(Debug, Default)]
pub(crate) struct ReservationTable {
    held: Mutex<HashMap<Reservation, WorkerId>>,
}

impl ReservationTable {
    pub(crate) fn claim(&self, reservation: Reservation, worker: WorkerId) -> Result<()> {
        let mut held = self.held.lock();
        if let Some(holder) = held.get(&reservation) {
            return Err(Error::ReservationConflict {
                reservation,
                holder: *holder,
            });
        }
        held.insert(reservation, worker);
        Ok(())
    }

    /// Release only if `worker` is still the holder.
    pub(crate) fn release(&self, reservation: Reservation, worker: WorkerId) {
        let mut held = self.held.lock();
        if held.get(&reservation) == Some(&worker) {
            held.remove(&reservation);
        }
    }

    #[cfg(test)]
    pub(crate) fn holder(&self, reservation: Reservation) -> Option<WorkerId> {
        self.held.lock().get(&reservation).copied()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Reservation, WorkerId)> {
        let mut held: Vec<_> = self.held.lock().iter().map(|(r, w)| (*r, *w)).collect();
        held.sort();
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "bridge_communication".parse::<Reservation>().unwrap(),
            Reservation::BridgeCommunication
        );
        assert_eq!(
            "external-state-manager".parse::<Reservation>().unwrap(),
            Reservation::ExternalStateManager
        );
        assert!(matches!(
            "kitchen_sink".parse::<Reservation>(),
            Err(Error::UnknownReservation(_))
        ));
    }

    #[test]
    fn test_names_round_trip() {
        for r in Reservation::ALL {
            assert_eq!(r.as_str().parse::<Reservation>().unwrap(), r);
        }
    }

    #[test]
    fn test_claim_conflict_and_release() {
        let table = ReservationTable::default();
        let a = WorkerId(1);
        let b = WorkerId(2);

        table.claim(Reservation::BridgeThread, a).unwrap();
        match table.claim(Reservation::BridgeThread, b) {
            Err(Error::ReservationConflict { holder, .. }) => assert_eq!(holder, a),
            other => panic!("unexpected: {:?}", other),
        }

        // A non-holder cannot release it.
        table.release(Reservation::BridgeThread, b);
        assert_eq!(table.holder(Reservation::BridgeThread), Some(a));

        table.release(Reservation::BridgeThread, a);
        assert!(table.claim(Reservation::BridgeThread, b).is_ok());
        assert_eq!(table.snapshot(), vec![(Reservation::BridgeThread, b)]);
    }
}
