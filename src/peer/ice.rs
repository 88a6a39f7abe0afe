use crate::logger::dump_candidate;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, Role};
use std::collections::VecDeque;

/// What happened to a candidate handed to [`CandidateBuffer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    Applied,
    Buffered,
    /// Authored by the local role.
    Ignored,
    /// Forwarded but rejected by the transport; logged and swallowed.
    Rejected,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Remote candidates that arrived before a remote description was set.
pub struct CandidateBuffer {
    local_role: Role,
    remote_ready: bool,
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new(local_role: Role) -> Self {
        Self {
            local_role,
            remote_ready: false,
            pending: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.remote_ready
    }

    /// Apply a remote candidate now if the remote description is known,
    /// otherwise queue it.
    pub async fn offer(&mut self, candidate: IceCandidate, pc: &dyn PeerTransport) -> Offered {
        if candidate.from == self.local_role {
            log::trace!("Skipping self-authored candidate");
            return Offered::Ignored;
        }

        dump_candidate("REMOTE", &candidate);

        if !self.remote_ready {
            log::debug!("Remote description not set yet, queuing candidate");
            self.pending.push_back(candidate);
            return Offered::Buffered;
        }

        match pc.add_ice_candidate(&candidate).await {
            Ok(()) => {
                log::debug!("Successfully added ICE candidate");
                Offered::Applied
            }
            Err(e) => {
                log::warn!("Failed to add ICE candidate: {e}");
                Offered::Rejected
            }
        }
    }

    /// Marks the remote description as applied and forwards every queued
    /// candidate in arrival order. One bad candidate does not stop the rest.
    pub async fn drain(&mut self, pc: &dyn PeerTransport) -> DrainReport {
        self.remote_ready = true;

        let mut report = DrainReport::default();
        if self.pending.is_empty() {
            return report;
        }

        log::info!("Processing {} buffered candidates", self.pending.len());
        analyze_candidates(self.pending.make_contiguous());

        while let Some(candidate) = self.pending.pop_front() {
            match pc.add_ice_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    log::warn!("Failed to apply pending candidate: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    log::debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count,
        srflx_count,
        relay_count
    );

    if relay_count == 0 {
        log::debug!("No TURN relay candidates found; traversal of symmetric NATs may fail");
    }
}
