//! msgr guardian — the background supervisor bound to one session.

pub mod guardian;

pub use guardian::{
    GuardianCounters, GuardianHandle, SessionGuardian, SessionGuardianStatus, KEEP_ALIVE_PATH,
};
