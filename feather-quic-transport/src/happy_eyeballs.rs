use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};

use crate::runtime::{QuicEventBase, QuicUdpSocket, TimerHandle};

/// Which of the two racing sockets writes may still go to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketEligibility {
    #[default]
    FirstOnly,
    SecondOnly,
    Both,
    /// Both sockets failed for good, the connection can not write anymore
    Neither,
}

impl SocketEligibility {
    pub fn first_eligible(self) -> bool {
        matches!(self, SocketEligibility::FirstOnly | SocketEligibility::Both)
    }

    pub fn second_eligible(self) -> bool {
        matches!(self, SocketEligibility::SecondOnly | SocketEligibility::Both)
    }

    fn from_flags(first: bool, second: bool) -> Self {
        match (first, second) {
            (true, true) => SocketEligibility::Both,
            (true, false) => SocketEligibility::FirstOnly,
            (false, true) => SocketEligibility::SecondOnly,
            (false, false) => SocketEligibility::Neither,
        }
    }

    pub(crate) fn without_first(self) -> Self {
        Self::from_flags(false, self.second_eligible())
    }

    pub(crate) fn without_second(self) -> Self {
        Self::from_flags(self.first_eligible(), false)
    }

    pub(crate) fn with_second(self) -> Self {
        Self::from_flags(self.first_eligible(), true)
    }
}

struct ConnAttemptDelay {
    event_base: Rc<QuicEventBase>,
    handle: TimerHandle,
}

/// Racing a second address family while the connection is being set up
#[derive(Default)]
pub struct QuicHappyEyeballsState {
    pub(crate) eligibility: SocketEligibility,
    pub(crate) second_socket: Option<Box<dyn QuicUdpSocket>>,
    pub(crate) second_peer_address: Option<SocketAddr>,
    conn_attempt_delay: Option<ConnAttemptDelay>,
}

impl QuicHappyEyeballsState {
    pub fn eligibility(&self) -> SocketEligibility {
        self.eligibility
    }

    pub fn set_second_socket(&mut self, socket: Box<dyn QuicUdpSocket>, peer_address: SocketAddr) {
        info!("Happy eyeballs second socket towards {}", peer_address);
        self.second_socket = Some(socket);
        self.second_peer_address = Some(peer_address);
    }

    /// Arms the delay after which the second socket joins the race.
    /// `on_fire` is expected to end up in `happy_eyeballs_start_second_socket`.
    pub fn schedule_conn_attempt_delay(
        &mut self,
        event_base: Rc<QuicEventBase>,
        delay: Duration,
        on_fire: Box<dyn FnOnce()>,
    ) {
        self.cancel_conn_attempt_delay();
        let handle = event_base.schedule_timeout(on_fire, delay);
        self.conn_attempt_delay = Some(ConnAttemptDelay { event_base, handle });
    }

    pub fn is_conn_attempt_delay_scheduled(&self) -> bool {
        self.conn_attempt_delay
            .as_ref()
            .is_some_and(|d| d.event_base.is_timeout_scheduled(d.handle))
    }

    pub fn cancel_conn_attempt_delay(&mut self) {
        if let Some(delay) = self.conn_attempt_delay.take() {
            delay.event_base.cancel_timeout(delay.handle);
        }
    }
}

pub fn happy_eyeballs_start_second_socket(state: &mut QuicHappyEyeballsState) {
    let Some(socket) = state.second_socket.as_mut() else {
        panic!("Happy eyeballs started without a second socket");
    };
    socket.resume_read();
    state.eligibility = state.eligibility.with_second();
    debug!("Happy eyeballs second socket started, {:?}", state.eligibility);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockUdpSocket;

    #[test]
    fn test_eligibility_transitions() {
        let state = SocketEligibility::default();
        assert!(state.first_eligible());
        assert!(!state.second_eligible());

        let state = state.with_second();
        assert_eq!(state, SocketEligibility::Both);
        let state = state.without_first();
        assert_eq!(state, SocketEligibility::SecondOnly);
        let state = state.without_second();
        assert_eq!(state, SocketEligibility::Neither);
    }

    #[test]
    fn test_start_second_socket() {
        let socket = MockUdpSocket::new();
        let paused = socket.paused.clone();
        paused.set(true);

        let mut state = QuicHappyEyeballsState::default();
        state.set_second_socket(Box::new(socket), "[::1]:4433".parse().unwrap());
        happy_eyeballs_start_second_socket(&mut state);
        assert_eq!(state.eligibility(), SocketEligibility::Both);
        assert!(!paused.get());
    }

    #[test]
    fn test_conn_attempt_delay_cancel() -> anyhow::Result<()> {
        let evb = Rc::new(QuicEventBase::new(Duration::from_millis(1))?);
        let mut state = QuicHappyEyeballsState::default();
        state.schedule_conn_attempt_delay(evb.clone(), Duration::from_secs(10), Box::new(|| {}));
        assert!(state.is_conn_attempt_delay_scheduled());
        state.cancel_conn_attempt_delay();
        assert!(!state.is_conn_attempt_delay_scheduled());
        Ok(())
    }
}
