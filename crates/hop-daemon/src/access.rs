//! Caller authorization
//!
//! The daemon serves every local user, but only one of them owns the tunnel
//! at a time. Root is always allowed.

use tracing::{debug, warn};

const ROOT_UID: u32 = 0;

/// Tracks which uid owns the current session
#[derive(Debug, Default)]
pub struct AccessControl {
    session_uid: Option<u32>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `uid` may issue `kind`. An accepted `activate` on an
    /// inactive tunnel makes the caller the session owner.
    pub fn authorize(&mut self, uid: Option<u32>, kind: &str, active: bool) -> bool {
        let Some(uid) = uid else {
            warn!("Unable to determine the caller, assuming unauthorized");
            return false;
        };

        if active {
            if uid == ROOT_UID || self.session_uid == Some(uid) {
                return true;
            }
            warn!("Command {} issued by unexpected user {}", kind, uid);
            return false;
        }

        match kind {
            "status" | "logs" => true,
            "activate" => {
                debug!("New session started by user {}", uid);
                self.session_uid = Some(uid);
                true
            }
            _ if uid == ROOT_UID => true,
            _ => {
                debug!("User {} is not authorized for {}, no ongoing session", uid, kind);
                false
            }
        }
    }

    /// Forget the owner once the tunnel is down
    pub fn reset(&mut self) {
        self.session_uid = None;
    }

    pub fn session_owner(&self) -> Option<u32> {
        self.session_uid
    }
}
