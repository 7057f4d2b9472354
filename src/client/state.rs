//! Client connection state machine.
//!
//! A synchronous reducer: [`ConnectionMachine::handle`] takes one [`Event`]
//! (a discovery callback, a socket outcome, a server response) and returns
//! the [`Action`]s the runtime must carry out. The machine does no I/O and
//! owns every piece of connection state, so all transitions are serialized
//! by whoever owns it.
//!
//! ```text
//! Idle -> Discovering -> CandidateFound -> Resolving -> Connecting
//!           ^                                 |            |
//!           |                                 v            v
//!           +------ (backoff) <---------- Handshaking -> Authenticated
//! ```
//!
//! Every resolve and connect is issued under a fresh [`AttemptId`]. Results
//! carrying an older attempt are stale and ignored, so an abandoned connect
//! that completes late can never resurrect a torn-down connection.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use super::backoff::{Backoff, BackoffPolicy};
use super::discovery::ServiceCandidate;
use crate::protocol::{Response, SourceType, IDENTITY_TAG};

pub type AttemptId = u64;

/// Resting states of the machine.
///
/// A dropped connection passes straight back to `Discovering`; there is no
/// resting disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Discovering,
    CandidateFound,
    Resolving,
    Connecting,
    Handshaking,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Stop,
    ServiceFound { name: String, more_coming: bool },
    ServiceRemoved { name: String },
    /// Answer to [`Action::Choose`]: an index into the offered candidates,
    /// or `None` to abort.
    CandidateChosen(Option<usize>),
    Resolved {
        attempt: AttemptId,
        addresses: Vec<SocketAddr>,
    },
    ResolveFailed { attempt: AttemptId, reason: String },
    Connected { attempt: AttemptId },
    ConnectFailed { attempt: AttemptId, reason: String },
    /// A reply to the identity frame.
    Response { attempt: AttemptId, response: Response },
    Disconnected { attempt: AttemptId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// (Re)subscribe to discovery after `delay`.
    StartBrowsing { delay: Duration },
    StopBrowsing,
    /// Ask the selection policy to pick one of several candidates.
    Choose(Vec<ServiceCandidate>),
    Resolve { attempt: AttemptId, name: String },
    Connect { attempt: AttemptId, addr: SocketAddr },
    /// Write the identity frame; nothing else may be written first.
    SendIdentity { attempt: AttemptId },
    /// Tear down the socket of `attempt`, connected or not.
    Close { attempt: AttemptId },
    /// The handshake succeeded; entity dispatch may begin.
    Authenticated { attempt: AttemptId, addr: SocketAddr },
}

#[derive(Debug)]
pub struct ConnectionMachine {
    phase: Phase,
    candidates: Vec<ServiceCandidate>,
    /// Snapshot handed to the selection policy; chosen indices refer to it
    offered: Vec<ServiceCandidate>,
    selected: Option<String>,
    tried: HashSet<String>,
    /// Resolved addresses of the selected candidate not yet attempted
    addresses: VecDeque<SocketAddr>,
    peer: Option<SocketAddr>,
    attempt: AttemptId,
    /// Addresses that rejected our identity; lives as long as the machine
    rejected: HashSet<SocketAddr>,
    backoff: Backoff,
    browsing: bool,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            phase: Phase::Idle,
            candidates: Vec::new(),
            offered: Vec::new(),
            selected: None,
            tried: HashSet::new(),
            addresses: VecDeque::new(),
            peer: None,
            attempt: 0,
            rejected: HashSet::new(),
            backoff: Backoff::new(policy),
            browsing: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Address of the socket being connected, handshaken or authenticated.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self.phase {
            Phase::Connecting | Phase::Handshaking | Phase::Authenticated => self.peer,
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    pub fn candidates(&self) -> &[ServiceCandidate] {
        &self.candidates
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn rejected_addresses(&self) -> &HashSet<SocketAddr> {
        &self.rejected
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            Event::Start => self.start(&mut actions),
            Event::Stop => self.stop(&mut actions),
            Event::ServiceFound { name, more_coming } => {
                self.on_found(name, more_coming, &mut actions)
            }
            Event::ServiceRemoved { name } => self.on_removed(&name, &mut actions),
            Event::CandidateChosen(index) => self.on_chosen(index, &mut actions),
            Event::Resolved { attempt, addresses } => {
                if self.is_current(attempt, Phase::Resolving) {
                    self.on_resolved(addresses, &mut actions);
                }
            }
            Event::ResolveFailed { attempt, reason } => {
                if self.is_current(attempt, Phase::Resolving) {
                    tracing::warn!(
                        service = self.selected.as_deref().unwrap_or_default(),
                        "Resolve failed: {}",
                        reason
                    );
                    self.next_candidate(&mut actions);
                }
            }
            Event::Connected { attempt } => {
                if self.is_current(attempt, Phase::Connecting) {
                    self.phase = Phase::Handshaking;
                    actions.push(Action::SendIdentity { attempt });
                } else {
                    // A connect that outlived its attempt
                    actions.push(Action::Close { attempt });
                }
            }
            Event::ConnectFailed { attempt, reason } => {
                if self.is_current(attempt, Phase::Connecting) {
                    tracing::warn!(peer = ?self.peer, "Connect failed: {}", reason);
                    self.connect_next(&mut actions);
                }
            }
            Event::Response { attempt, response } => {
                if self.is_current(attempt, Phase::Handshaking)
                    && response.source_type == SourceType::Hello
                    && response.source_tag == IDENTITY_TAG
                {
                    self.on_hello_response(attempt, response, &mut actions);
                }
            }
            Event::Disconnected { attempt, reason } => {
                self.on_disconnected(attempt, &reason, &mut actions)
            }
        }

        actions
    }

    fn is_current(&self, attempt: AttemptId, phase: Phase) -> bool {
        self.attempt == attempt && self.phase == phase
    }

    fn next_attempt(&mut self) -> AttemptId {
        self.attempt += 1;
        self.attempt
    }

    fn close_current(&mut self, actions: &mut Vec<Action>) {
        // An in-flight connect is closed when its stale result arrives
        if matches!(self.phase, Phase::Handshaking | Phase::Authenticated) {
            actions.push(Action::Close {
                attempt: self.attempt,
            });
        }
    }

    fn clear_candidates(&mut self) {
        self.candidates.clear();
        self.offered.clear();
        self.selected = None;
        self.tried.clear();
        self.addresses.clear();
        self.peer = None;
    }

    fn subscribe(&mut self, delay: Duration, actions: &mut Vec<Action>) {
        if self.browsing {
            actions.push(Action::StopBrowsing);
        }
        actions.push(Action::StartBrowsing { delay });
        self.browsing = true;
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn start(&mut self, actions: &mut Vec<Action>) {
        self.close_current(actions);
        self.clear_candidates();
        self.next_attempt();
        self.phase = Phase::Discovering;
        self.subscribe(Duration::ZERO, actions);
    }

    fn stop(&mut self, actions: &mut Vec<Action>) {
        self.close_current(actions);
        self.clear_candidates();
        self.next_attempt();
        if self.browsing {
            actions.push(Action::StopBrowsing);
            self.browsing = false;
        }
        self.phase = Phase::Idle;
    }

    /// Drop all candidate state and browse again after a backoff delay.
    fn restart_discovery(&mut self, actions: &mut Vec<Action>) {
        self.close_current(actions);
        self.clear_candidates();
        self.next_attempt();
        self.phase = Phase::Discovering;
        let delay = self.backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Restarting discovery");
        self.subscribe(delay, actions);
    }

    fn on_found(&mut self, name: String, more_coming: bool, actions: &mut Vec<Action>) {
        if self.phase == Phase::Idle {
            return;
        }
        if !self.candidates.iter().any(|c| c.name == name) {
            tracing::info!(service = %name, "Found service");
            self.candidates.push(ServiceCandidate::new(name));
        }
        if self.phase != Phase::Discovering || more_coming {
            return;
        }

        self.phase = Phase::CandidateFound;
        if self.candidates.len() == 1 {
            let name = self.candidates[0].name.clone();
            self.select(name, actions);
        } else {
            self.offered = self.candidates.clone();
            actions.push(Action::Choose(self.offered.clone()));
        }
    }

    fn on_chosen(&mut self, index: Option<usize>, actions: &mut Vec<Action>) {
        if self.phase != Phase::CandidateFound || self.selected.is_some() {
            return;
        }
        let chosen = index
            .and_then(|i| self.offered.get(i))
            .map(|c| c.name.clone());
        match chosen {
            Some(name) if self.candidates.iter().any(|c| c.name == name) => {
                self.select(name, actions)
            }
            Some(name) => {
                tracing::warn!(service = %name, "Chosen service disappeared");
                self.restart_discovery(actions);
            }
            None => {
                tracing::info!("No service chosen, stopping");
                self.stop(actions);
            }
        }
    }

    fn select(&mut self, name: String, actions: &mut Vec<Action>) {
        self.offered.clear();
        self.tried.insert(name.clone());
        self.selected = Some(name.clone());
        self.addresses.clear();
        self.phase = Phase::Resolving;
        let attempt = self.next_attempt();
        tracing::debug!(service = %name, attempt, "Resolving service");
        actions.push(Action::Resolve { attempt, name });
    }

    /// Fall through to the next untried candidate, else rediscover.
    fn next_candidate(&mut self, actions: &mut Vec<Action>) {
        let next = self
            .candidates
            .iter()
            .find(|c| !self.tried.contains(&c.name))
            .map(|c| c.name.clone());
        match next {
            Some(name) => self.select(name, actions),
            None => self.restart_discovery(actions),
        }
    }

    fn on_resolved(&mut self, addresses: Vec<SocketAddr>, actions: &mut Vec<Action>) {
        let total = addresses.len();
        self.addresses = addresses
            .into_iter()
            .filter(|a| !self.rejected.contains(a))
            .collect();

        if let Some(selected) = &self.selected {
            if let Some(candidate) = self.candidates.iter_mut().find(|c| &c.name == selected) {
                candidate.addresses = self.addresses.iter().copied().collect();
            }
        }
        tracing::debug!(
            service = self.selected.as_deref().unwrap_or_default(),
            total,
            usable = self.addresses.len(),
            "Resolved service"
        );
        self.connect_next(actions);
    }

    /// Try the next untried address, else rediscover.
    fn connect_next(&mut self, actions: &mut Vec<Action>) {
        match self.addresses.pop_front() {
            Some(addr) => {
                self.peer = Some(addr);
                self.phase = Phase::Connecting;
                let attempt = self.next_attempt();
                tracing::debug!(peer = %addr, attempt, "Connecting");
                actions.push(Action::Connect { attempt, addr });
            }
            None => {
                tracing::warn!("All addresses exhausted");
                self.restart_discovery(actions);
            }
        }
    }

    fn on_hello_response(
        &mut self,
        attempt: AttemptId,
        response: Response,
        actions: &mut Vec<Action>,
    ) {
        let Some(addr) = self.peer else {
            return;
        };

        if response.accepted {
            self.phase = Phase::Authenticated;
            self.backoff.reset();
            // The candidate served its purpose
            self.candidates.clear();
            self.tried.clear();
            self.addresses.clear();
            actions.push(Action::Authenticated { attempt, addr });
        } else {
            self.rejected.insert(addr);
            self.restart_discovery(actions);
        }
    }

    fn on_disconnected(&mut self, attempt: AttemptId, reason: &str, actions: &mut Vec<Action>) {
        if attempt != self.attempt {
            return;
        }
        match self.phase {
            Phase::Handshaking => {
                tracing::warn!(peer = ?self.peer, "Lost connection before handshake: {}", reason);
                self.close_current(actions);
                self.phase = Phase::Connecting;
                self.connect_next(actions);
            }
            Phase::Authenticated => {
                tracing::warn!(peer = ?self.peer, "Disconnected: {}", reason);
                self.restart_discovery(actions);
            }
            _ => {}
        }
    }

    fn on_removed(&mut self, name: &str, actions: &mut Vec<Action>) {
        let before = self.candidates.len();
        self.candidates.retain(|c| c.name != name);
        if self.candidates.len() == before {
            return;
        }
        tracing::info!(service = %name, "Service removed");

        let selected = self.selected.as_deref() == Some(name);
        let connecting = matches!(
            self.phase,
            Phase::CandidateFound | Phase::Resolving | Phase::Connecting | Phase::Handshaking
        );
        if selected && connecting {
            self.restart_discovery(actions);
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn found(name: &str, more_coming: bool) -> Event {
        Event::ServiceFound {
            name: name.into(),
            more_coming,
        }
    }

    fn accept() -> Response {
        Response::hello(true, None)
    }

    fn reject() -> Response {
        Response::hello(false, Some("device blocked".into()))
    }

    fn resolve_attempt(actions: &[Action]) -> (AttemptId, String) {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Resolve { attempt, name } => Some((*attempt, name.clone())),
                _ => None,
            })
            .expect("resolve action")
    }

    fn connect_attempt(actions: &[Action]) -> (AttemptId, SocketAddr) {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Connect { attempt, addr } => Some((*attempt, *addr)),
                _ => None,
            })
            .expect("connect action")
    }

    /// Machine that found one service and is resolving it.
    fn resolving(name: &str) -> (ConnectionMachine, AttemptId) {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        let actions = m.handle(found(name, false));
        let (attempt, _) = resolve_attempt(&actions);
        (m, attempt)
    }

    #[test]
    fn test_start_subscribes_immediately() {
        let mut m = ConnectionMachine::default();
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(
            m.handle(Event::Start),
            vec![Action::StartBrowsing {
                delay: Duration::ZERO
            }]
        );
        assert_eq!(m.phase(), Phase::Discovering);

        // A second start cancels the previous subscription first
        assert_eq!(
            m.handle(Event::Start),
            vec![
                Action::StopBrowsing,
                Action::StartBrowsing {
                    delay: Duration::ZERO
                }
            ]
        );
    }

    #[test]
    fn test_single_candidate_selected_automatically() {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        let actions = m.handle(found("desk", false));
        assert_eq!(m.phase(), Phase::Resolving);
        assert_eq!(resolve_attempt(&actions).1, "desk");
        assert_eq!(m.selected(), Some("desk"));
    }

    #[test]
    fn test_more_coming_defers_selection() {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        assert!(m.handle(found("a", true)).is_empty());
        assert_eq!(m.phase(), Phase::Discovering);

        let actions = m.handle(found("b", false));
        assert_eq!(m.phase(), Phase::CandidateFound);
        assert_eq!(
            actions,
            vec![Action::Choose(vec![
                ServiceCandidate::new("a"),
                ServiceCandidate::new("b")
            ])]
        );

        let actions = m.handle(Event::CandidateChosen(Some(1)));
        assert_eq!(resolve_attempt(&actions).1, "b");
    }

    #[test]
    fn test_no_choice_aborts_to_idle() {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        m.handle(found("a", true));
        m.handle(found("b", false));

        let actions = m.handle(Event::CandidateChosen(None));
        assert_eq!(actions, vec![Action::StopBrowsing]);
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.candidates().is_empty());

        // Late discovery events are ignored while idle
        assert!(m.handle(found("c", false)).is_empty());
    }

    #[test]
    fn test_failover_tries_addresses_in_order() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1), addr(2), addr(3)],
        });

        let mut tried = Vec::new();
        let (mut attempt, first) = connect_attempt(&actions);
        tried.push(first);
        for _ in 0..2 {
            let actions = m.handle(Event::ConnectFailed {
                attempt,
                reason: "connection refused".into(),
            });
            let (next, a) = connect_attempt(&actions);
            attempt = next;
            tried.push(a);
        }
        assert_eq!(tried, vec![addr(1), addr(2), addr(3)]);

        assert_eq!(
            m.handle(Event::Connected { attempt }),
            vec![Action::SendIdentity { attempt }]
        );
        assert_eq!(m.phase(), Phase::Handshaking);

        let actions = m.handle(Event::Response {
            attempt,
            response: accept(),
        });
        assert_eq!(
            actions,
            vec![Action::Authenticated {
                attempt,
                addr: addr(3)
            }]
        );
        assert!(m.is_authenticated());
        assert_eq!(m.peer(), Some(addr(3)));
    }

    #[test]
    fn test_exhausted_addresses_restart_discovery_with_backoff() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        let (attempt, _) = connect_attempt(&actions);

        let actions = m.handle(Event::ConnectFailed {
            attempt,
            reason: "refused".into(),
        });
        assert_eq!(m.phase(), Phase::Discovering);
        assert!(m.candidates().is_empty());
        assert_eq!(
            actions,
            vec![
                Action::StopBrowsing,
                Action::StartBrowsing {
                    delay: BackoffPolicy::default().initial
                }
            ]
        );
    }

    #[test]
    fn test_rejection_excludes_address_next_time() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1), addr(2)],
        });
        let (attempt, a) = connect_attempt(&actions);
        assert_eq!(a, addr(1));
        m.handle(Event::Connected { attempt });

        let actions = m.handle(Event::Response {
            attempt,
            response: reject(),
        });
        assert!(actions.contains(&Action::Close { attempt }));
        assert_eq!(m.phase(), Phase::Discovering);
        assert!(m.rejected_addresses().contains(&addr(1)));

        // Rediscovered: the rejecting address is skipped
        let actions = m.handle(found("svc", false));
        let (attempt, _) = resolve_attempt(&actions);
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1), addr(2)],
        });
        assert_eq!(connect_attempt(&actions).1, addr(2));
    }

    #[test]
    fn test_all_addresses_rejected_restarts() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        let (attempt, _) = connect_attempt(&actions);
        m.handle(Event::Connected { attempt });
        m.handle(Event::Response {
            attempt,
            response: reject(),
        });

        let actions = m.handle(found("svc", false));
        let (attempt, _) = resolve_attempt(&actions);
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        assert!(actions
            .iter()
            .all(|a| !matches!(a, Action::Connect { .. })));
        assert_eq!(m.phase(), Phase::Discovering);
    }

    #[test]
    fn test_resolve_failure_falls_through_to_next_candidate() {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        m.handle(found("a", true));
        m.handle(found("b", false));
        let actions = m.handle(Event::CandidateChosen(Some(0)));
        let (attempt, name) = resolve_attempt(&actions);
        assert_eq!(name, "a");

        let actions = m.handle(Event::ResolveFailed {
            attempt,
            reason: "timed out".into(),
        });
        let (attempt, name) = resolve_attempt(&actions);
        assert_eq!(name, "b");

        m.handle(Event::ResolveFailed {
            attempt,
            reason: "timed out".into(),
        });
        assert_eq!(m.phase(), Phase::Discovering);
    }

    #[test]
    fn test_stale_events_ignored() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1), addr(2)],
        });
        let (first, _) = connect_attempt(&actions);
        let actions = m.handle(Event::ConnectFailed {
            attempt: first,
            reason: "refused".into(),
        });
        let (second, _) = connect_attempt(&actions);

        // The first attempt's late success is closed, not adopted
        assert_eq!(
            m.handle(Event::Connected { attempt: first }),
            vec![Action::Close { attempt: first }]
        );
        assert_eq!(m.phase(), Phase::Connecting);
        assert_eq!(m.peer(), Some(addr(2)));

        assert!(m
            .handle(Event::Resolved {
                attempt,
                addresses: vec![addr(9)]
            })
            .is_empty());
        assert!(m
            .handle(Event::Disconnected {
                attempt: first,
                reason: "eof".into()
            })
            .is_empty());

        m.handle(Event::Connected { attempt: second });
        assert_eq!(m.phase(), Phase::Handshaking);
    }

    #[test]
    fn test_drop_during_handshake_fails_over() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1), addr(2)],
        });
        let (attempt, _) = connect_attempt(&actions);
        m.handle(Event::Connected { attempt });

        let actions = m.handle(Event::Disconnected {
            attempt,
            reason: "reset".into(),
        });
        assert_eq!(actions[0], Action::Close { attempt });
        assert_eq!(connect_attempt(&actions).1, addr(2));
    }

    #[test]
    fn test_disconnect_after_auth_rediscovers_and_backoff_resets() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        let (attempt, _) = connect_attempt(&actions);
        m.handle(Event::Connected { attempt });
        m.handle(Event::Response {
            attempt,
            response: accept(),
        });

        let actions = m.handle(Event::Disconnected {
            attempt,
            reason: "eof".into(),
        });
        assert_eq!(m.phase(), Phase::Discovering);
        assert!(actions.contains(&Action::Close { attempt }));
        assert!(actions.contains(&Action::StartBrowsing {
            delay: BackoffPolicy::default().initial
        }));
        assert_eq!(m.peer(), None);
    }

    #[test]
    fn test_entity_response_ignored_by_machine() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        let (attempt, _) = connect_attempt(&actions);
        m.handle(Event::Connected { attempt });

        assert!(m
            .handle(Event::Response {
                attempt,
                response: Response::entity_ack(100)
            })
            .is_empty());
        assert_eq!(m.phase(), Phase::Handshaking);
    }

    #[test]
    fn test_removing_selected_candidate_restarts() {
        let (mut m, _) = resolving("svc");
        assert!(m
            .handle(Event::ServiceRemoved {
                name: "other".into()
            })
            .is_empty());

        let actions = m.handle(Event::ServiceRemoved { name: "svc".into() });
        assert_eq!(m.phase(), Phase::Discovering);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartBrowsing { .. })));
    }

    #[test]
    fn test_removed_candidate_not_offered_as_fallback() {
        let mut m = ConnectionMachine::default();
        m.handle(Event::Start);
        m.handle(found("a", true));
        m.handle(found("b", true));
        m.handle(found("c", false));
        let actions = m.handle(Event::CandidateChosen(Some(0)));
        let (attempt, _) = resolve_attempt(&actions);

        m.handle(Event::ServiceRemoved { name: "b".into() });
        let actions = m.handle(Event::ResolveFailed {
            attempt,
            reason: "gone".into(),
        });
        assert_eq!(resolve_attempt(&actions).1, "c");
    }

    #[test]
    fn test_stop_closes_connection() {
        let (mut m, attempt) = resolving("svc");
        let actions = m.handle(Event::Resolved {
            attempt,
            addresses: vec![addr(1)],
        });
        let (attempt, _) = connect_attempt(&actions);
        m.handle(Event::Connected { attempt });

        let actions = m.handle(Event::Stop);
        assert_eq!(
            actions,
            vec![Action::Close { attempt }, Action::StopBrowsing]
        );
        assert_eq!(m.phase(), Phase::Idle);
    }
}
