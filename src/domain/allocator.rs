use std::{
    collections::HashMap,
    net::{Ipv4Addr, TcpListener},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::error::DeployError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Handed out by the allocator, owning record not stored yet.
    Reserved,
    Owned(String),
}

/// Ports known to be in use by this controller, shared by the allocator and
/// the registry so both agree on what is taken.
#[derive(Clone, Default)]
pub struct PortLedger {
    claims: Arc<Mutex<HashMap<u16, Claim>>>,
}

impl PortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<u16, Claim>> {
        self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn claim_of(&self, port: u16) -> Option<Claim> {
        self.claims().get(&port).cloned()
    }

    pub fn try_reserve(&self, port: u16) -> Option<PortReservation> {
        let mut claims = self.claims();
        if claims.contains_key(&port) {
            return None;
        }
        claims.insert(port, Claim::Reserved);
        Some(PortReservation {
            port,
            ledger: self.clone(),
            committed: false,
        })
    }

    /// Turns a reservation into ownership by `owner`.
    pub fn commit(&self, mut reservation: PortReservation, owner: &str) {
        self.claims()
            .insert(reservation.port, Claim::Owned(owner.to_string()));
        reservation.committed = true;
    }

    /// Records ownership of a port restored from storage.
    pub fn claim(&self, port: u16, owner: &str) -> Result<(), DeployError> {
        let mut claims = self.claims();
        match claims.get(&port) {
            Some(Claim::Owned(current)) if current != owner => Err(DeployError::PortInUse {
                port,
                owner: current.clone(),
            }),
            Some(Claim::Reserved) => Err(DeployError::PortInUse {
                port,
                owner: String::from("<reserved>"),
            }),
            _ => {
                claims.insert(port, Claim::Owned(owner.to_string()));
                Ok(())
            }
        }
    }

    pub fn release(&self, port: u16, owner: &str) {
        let mut claims = self.claims();
        if claims.get(&port) == Some(&Claim::Owned(owner.to_string())) {
            claims.remove(&port);
        }
    }

    fn cancel(&self, port: u16) {
        let mut claims = self.claims();
        if claims.get(&port) == Some(&Claim::Reserved) {
            claims.remove(&port);
        }
    }
}

/// A provisionally held port. Dropping it without committing gives the port back.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    ledger: PortLedger,
    committed: bool,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if !self.committed {
            debug!("Releasing reserved port {}", self.port);
            self.ledger.cancel(self.port);
        }
    }
}

impl std::fmt::Debug for PortLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLedger")
            .field("claims", &self.claims().len())
            .finish()
    }
}

pub struct PortAllocator {
    min: u16,
    max: u16,
    attempts: u32,
    ledger: PortLedger,
    rng: Mutex<StdRng>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16, attempts: u32, ledger: PortLedger) -> Self {
        Self::with_rng(min, max, attempts, ledger, StdRng::from_entropy())
    }

    pub fn with_rng(min: u16, max: u16, attempts: u32, ledger: PortLedger, rng: StdRng) -> Self {
        Self {
            min,
            max,
            attempts,
            ledger,
            rng: Mutex::new(rng),
        }
    }

    /// Picks a random port of the range that is neither claimed by this
    /// controller nor bound by any process on the host.
    pub fn allocate(&self) -> Result<PortReservation, DeployError> {
        for _ in 0..self.attempts {
            let candidate = self.candidate();
            let Some(reservation) = self.ledger.try_reserve(candidate) else {
                debug!("Port {} already claimed, trying another one", candidate);
                continue;
            };
            if is_bindable(candidate) {
                info!("Free port found : {}", candidate);
                return Ok(reservation);
            }
            debug!("Port {} bound by another process", candidate);
        }
        warn!(
            "No free port in range {}-{} after {} attempts",
            self.min, self.max, self.attempts
        );
        Err(DeployError::NoFreePort {
            min: self.min,
            max: self.max,
            attempts: self.attempts,
        })
    }

    fn candidate(&self) -> u16 {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen_range(self.min..=self.max)
    }
}

/// Transient bind-and-release check.
fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
