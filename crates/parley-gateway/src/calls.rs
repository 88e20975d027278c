//! Server-side book of ringing and active calls.
//!
//! The book only decides; the dispatcher turns each outcome into events.
//! A user is busy while they are a participant of any call or are being
//! rung by one. Busy targets are rejected, never queued.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use parley_types::EndReason;

use crate::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Ringing,
    Active,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: String,
    pub initiator: String,
    /// User or group named in `call_start`.
    pub target: String,
    pub is_group: bool,
    pub phase: CallPhase,
    /// Everyone who was rung.
    pub invited: BTreeSet<String>,
    /// Invitees still ringing.
    pub ringing: BTreeSet<String>,
    /// Initiator plus the acceptor once answered.
    pub participants: BTreeSet<String>,
    pub started_at: Instant,
}

impl CallRecord {
    fn involves(&self, user: &str) -> bool {
        self.participants.contains(user) || self.ringing.contains(user)
    }

    /// Everyone still attached to the call except `user`.
    fn others(&self, user: &str) -> Vec<String> {
        self.participants
            .iter()
            .chain(self.ringing.iter())
            .filter(|name| name.as_str() != user)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of a successful `call_accept`.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub call: CallRecord,
    /// Other invitees of a group call, no longer ringing.
    pub answered_elsewhere: Vec<String>,
}

/// A user left a call, or the call ended.
#[derive(Debug, Clone)]
pub struct CallEnd {
    pub call: CallRecord,
    /// Who caused it.
    pub by: String,
    pub reason: EndReason,
    /// Users to send `call_ended` to.
    pub notify: Vec<String>,
    /// Whether the call was removed from the book.
    pub finished: bool,
}

pub struct CallBook {
    calls: Mutex<HashMap<String, CallRecord>>,
}

impl CallBook {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CallRecord>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }


    /// Open a ringing call. `candidates` are the online users to ring; busy
    /// ones are rejected for a direct call and skipped for a group call.
    pub fn start(
        &self,
        initiator: &str,
        target: &str,
        is_group: bool,
        candidates: Vec<String>,
    ) -> Result<CallRecord, StateError> {
        let mut calls = self.lock();
        let busy = |user: &str| calls.values().any(|call| call.involves(user));

        if busy(initiator) {
            return Err(StateError::CallerBusy);
        }

        let ringing: BTreeSet<String> = if is_group {
            candidates
                .into_iter()
                .filter(|user| user != initiator && !busy(user))
                .collect()
        } else {
            if busy(target) {
                return Err(StateError::UserBusy(target.to_string()));
            }
            candidates.into_iter().collect()
        };

        if ringing.is_empty() {
            return Err(if is_group {
                StateError::NobodyReachable(target.to_string())
            } else {
                StateError::UserOffline(target.to_string())
            });
        }

        let call = CallRecord {
            id: Uuid::new_v4().to_string(),
            initiator: initiator.to_string(),
            target: target.to_string(),
            is_group,
            phase: CallPhase::Ringing,
            invited: ringing.clone(),
            ringing,
            participants: BTreeSet::from([initiator.to_string()]),
            started_at: Instant::now(),
        };
        info!(
            "Call {} from {} to {} ringing {} user(s)",
            call.id,
            initiator,
            target,
            call.ringing.len()
        );
        calls.insert(call.id.clone(), call.clone());
        Ok(call)
    }

    /// Answer a ringing call, by id or else by (caller, acceptor) pair.
    /// The first acceptor wins.
    pub fn accept(
        &self,
        acceptor: &str,
        caller: &str,
        call_id: Option<&str>,
    ) -> Result<Accepted, StateError> {
        let mut calls = self.lock();

        let id = match call_id {
            Some(id) => {
                let call = calls.get(id).ok_or(StateError::CallNotFound)?;
                if !call.invited.contains(acceptor) {
                    return Err(StateError::CallNotFound);
                }
                id.to_string()
            }
            None => calls
                .values()
                .filter(|call| call.initiator == caller && call.invited.contains(acceptor))
                .min_by_key(|call| (call.phase != CallPhase::Ringing, call.started_at))
                .map(|call| call.id.clone())
                .ok_or(StateError::CallNotFound)?,
        };

        let busy_elsewhere = calls
            .values()
            .any(|call| call.id != id && call.participants.contains(acceptor));
        if busy_elsewhere {
            return Err(StateError::CallerBusy);
        }

        let call = calls.get_mut(&id).ok_or(StateError::CallNotFound)?;
        if call.phase != CallPhase::Ringing || !call.ringing.contains(acceptor) {
            return Err(StateError::CallAnswered);
        }

        call.ringing.remove(acceptor);
        let answered_elsewhere: Vec<String> = std::mem::take(&mut call.ringing).into_iter().collect();
        call.participants.insert(acceptor.to_string());
        call.phase = CallPhase::Active;
        info!("Call {} answered by {}", call.id, acceptor);

        Ok(Accepted {
            call: call.clone(),
            answered_elsewhere,
        })
    }

    /// `call_end` from `user`. Stale ids and outsiders yield `None`.
    pub fn end(&self, user: &str, call_id: &str) -> Option<CallEnd> {
        let mut calls = self.lock();
        let Some(call) = calls.get(call_id) else {
            debug!("Ignoring call_end for unknown call {}", call_id);
            return None;
        };

        if call.participants.contains(user) {
            let call = calls.remove(call_id)?;
            info!("Call {} hung up by {}", call.id, user);
            return Some(CallEnd {
                notify: call.others(user),
                by: user.to_string(),
                reason: EndReason::Hangup,
                finished: true,
                call,
            });
        }

        if call.ringing.contains(user) {
            return decline(&mut calls, call_id, user, EndReason::Declined);
        }

        debug!("Ignoring call_end from {} who is not part of call {}", user, call_id);
        None
    }

    /// Ringing timeout. Active calls are untouched.
    pub fn expire(&self, call_id: &str) -> Option<CallEnd> {
        let mut calls = self.lock();
        if calls.get(call_id)?.phase != CallPhase::Ringing {
            return None;
        }
        let call = calls.remove(call_id)?;
        info!("Call {} timed out while ringing", call.id);
        Some(CallEnd {
            notify: call.others(""),
            by: call.initiator.clone(),
            reason: EndReason::Timeout,
            finished: true,
            call,
        })
    }

    /// End or decline every call `user` is part of, e.g. on disconnect.
    pub fn drop_user(&self, user: &str) -> Vec<CallEnd> {
        let mut calls = self.lock();
        let ids: Vec<String> = calls
            .values()
            .filter(|call| call.involves(user))
            .map(|call| call.id.clone())
            .collect();

        let mut ended = Vec::new();
        for id in ids {
            let is_participant = calls.get(&id).is_some_and(|call| call.participants.contains(user));
            if is_participant {
                if let Some(call) = calls.remove(&id) {
                    info!("Call {} ended: {} disconnected", call.id, user);
                    ended.push(CallEnd {
                        notify: call.others(user),
                        by: user.to_string(),
                        reason: EndReason::Disconnected,
                        finished: true,
                        call,
                    });
                }
            } else if let Some(end) = decline(&mut calls, &id, user, EndReason::Declined) {
                ended.push(end);
            }
        }
        ended
    }
}

impl Default for CallBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `user` from the ringing set. The call ends, and its initiator is
/// told, once nobody is left ringing.
fn decline(
    calls: &mut HashMap<String, CallRecord>,
    call_id: &str,
    user: &str,
    reason: EndReason,
) -> Option<CallEnd> {
    let call = calls.get_mut(call_id)?;
    call.ringing.remove(user);
    info!("{} declined call {}", user, call_id);

    if !call.ringing.is_empty() || call.phase != CallPhase::Ringing {
        return Some(CallEnd {
            call: call.clone(),
            by: user.to_string(),
            reason,
            notify: Vec::new(),
            finished: false,
        });
    }

    let call = calls.remove(call_id)?;
    Some(CallEnd {
        notify: vec![call.initiator.clone()],
        by: user.to_string(),
        reason,
        finished: true,
        call,
    })
}
