use std::collections::HashMap;

use thiserror::Error;

/// Where a user stands in the pairing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Idle,
    /// One side has dialed and the other has not yet.
    Dialing,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DialRejection {
    #[error("invalid remote uid")]
    InvalidRemote,
    #[error("invalid local uid")]
    InvalidLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// First dialer of the pair. Nothing is sent until the partner dials.
    Waiting,
    /// Second dialer. `initiator` dialed first and sends the offer.
    Paired { initiator: String },
    Rejected(DialRejection),
}

#[derive(Debug, Clone)]
struct User {
    state: UserState,
    partner: String,
    /// False for a placeholder created by the partner's dial.
    connected: bool,
}

/// The relay's user table. Pure bookkeeping; connections live elsewhere.
#[derive(Debug, Default)]
pub struct Registry {
    users: HashMap<String, User>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, uid: &str) -> UserState {
        self.users
            .get(uid)
            .map(|user| user.state)
            .unwrap_or(UserState::Idle)
    }

    pub fn partner(&self, uid: &str) -> Option<&str> {
        self.users.get(uid).map(|user| user.partner.as_str())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn dial(&mut self, local: &str, remote: &str) -> DialOutcome {
        if local == remote {
            return DialOutcome::Rejected(DialRejection::InvalidRemote);
        }

        match self.state(local) {
            UserState::Idle => {
                if self.state(remote) != UserState::Idle {
                    return DialOutcome::Rejected(DialRejection::InvalidRemote);
                }
                self.users.insert(
                    local.to_string(),
                    User {
                        state: UserState::Dialing,
                        partner: remote.to_string(),
                        connected: true,
                    },
                );
                self.users.insert(
                    remote.to_string(),
                    User {
                        state: UserState::Dialing,
                        partner: local.to_string(),
                        connected: false,
                    },
                );
                DialOutcome::Waiting
            }
            UserState::Dialing => {
                let Some(user) = self.users.get_mut(local) else {
                    return DialOutcome::Rejected(DialRejection::InvalidLocal);
                };
                // Already claimed by the connection that dialed first.
                if user.connected {
                    return DialOutcome::Rejected(DialRejection::InvalidLocal);
                }
                if user.partner != remote {
                    return DialOutcome::Rejected(DialRejection::InvalidRemote);
                }
                user.state = UserState::Busy;
                user.connected = true;
                if let Some(partner) = self.users.get_mut(remote) {
                    partner.state = UserState::Busy;
                }
                DialOutcome::Paired {
                    initiator: remote.to_string(),
                }
            }
            UserState::Busy => DialOutcome::Rejected(DialRejection::InvalidLocal),
        }
    }

    /// Removes `uid` and returns the partner that should be told to stop.
    ///
    /// A partner that never connected is dropped along with it and nobody is
    /// notified.
    pub fn leave(&mut self, uid: &str) -> Option<String> {
        let user = self.users.remove(uid)?;
        let partner = self.users.get(&user.partner)?;
        if partner.partner != uid {
            return None;
        }
        if !partner.connected {
            self.users.remove(&user.partner);
            return None;
        }
        Some(user.partner)
    }
}
