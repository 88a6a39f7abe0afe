//! Per-session negotiation state.
//!
//! Every mutation goes through a transition function so role, identifier and
//! the remote-description flag never drift apart.

use crate::peer::types::Role;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting_answer",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: NegotiationState,
    pub to: NegotiationState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {} -> {}", self.from, self.to)
    }
}

/// Explicit state of one live session.
#[derive(Debug, Clone)]
pub struct SessionState {
    id: String,
    role: Role,
    negotiation: NegotiationState,
    remote_applied: bool,
    record_deleted: bool,
}

impl SessionState {
    pub fn new(id: String, role: Role) -> Self {
        Self {
            id,
            role,
            negotiation: NegotiationState::Idle,
            remote_applied: false,
            record_deleted: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    fn allowed(&self, to: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self.negotiation, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Closed) => true,
            (Idle, Offering) => self.role == Role::Initiator,
            (Offering, AwaitingAnswer) => true,
            (AwaitingAnswer, Connected) => true,
            (Idle, Answering) => self.role == Role::Joiner,
            (Answering, Connected) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: NegotiationState) -> Result<(), InvalidTransition> {
        if !self.allowed(to) {
            return Err(InvalidTransition {
                from: self.negotiation,
                to,
            });
        }
        log::debug!("session {}: {} -> {}", self.id, self.negotiation, to);
        self.negotiation = to;
        Ok(())
    }

    /// Records that a remote description has been applied. Returns false when
    /// one already was, so a repeated answer is ignored.
    pub fn mark_remote_applied(&mut self) -> bool {
        if self.remote_applied {
            return false;
        }
        self.remote_applied = true;
        true
    }

    /// Only the initiator owns the relay record, and it is removed at most once.
    pub fn take_record_deletion(&mut self) -> bool {
        if self.role != Role::Initiator || self.record_deleted {
            return false;
        }
        self.record_deleted = true;
        true
    }
}
