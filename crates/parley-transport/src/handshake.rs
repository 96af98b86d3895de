//! The Init1 micro state machine.
//!
//! Before any session exists, client and server run a fixed exchange over
//! Init1 packets, identified by a step byte at the start of the payload:
//!
//! ```text
//! step 0  C->S  21 bytes   version ∥ 0 ∥ timestamp ∥ random ∥ reserved:8
//! step 1  S->C  21 bytes   1 ∥ reversed random ∥ cookie:16
//! step 2  C->S  25 bytes   version ∥ 2 ∥ cookie:16 ∥ reversed random
//! step 3  S->C  233 bytes  3 ∥ x:64 ∥ n:64 ∥ level:u32 ∥ blob:100
//! step 4  C->S  297+text   4 ∥ x ∥ n ∥ level ∥ blob ∥ y:64 ∥ command
//! ```
//!
//! Step 1 proves the server saw our random (anti-spoofing); step 3 poses
//! the time-lock puzzle whose solution `y` rides in step 4 together with
//! the first real command text. The server may instead answer `0x7F` (a
//! 5-byte cookie refresh) at any point, which restarts the exchange from
//! step 0. Any payload whose length does not match its step byte exactly
//! is a hard error that aborts the handshake.

use crate::error::HandshakeError;
use parley_crypto::puzzle;

const STEP1_LEN: usize = 21;
const STEP3_LEN: usize = 233;
const REFRESH_LEN: usize = 5;

/// What the machine wants sent in response to a server payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Init1Reply {
    /// Next Init1 payload; the exchange continues
    Send(Vec<u8>),
    /// Final step-4 payload; the Init1 phase is over
    Finish(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingCookie,
    AwaitingPuzzle,
    Done,
}

impl State {
    fn expected_step(self) -> u8 {
        match self {
            Self::AwaitingCookie => 1,
            Self::AwaitingPuzzle => 3,
            Self::Done => 0x7F,
        }
    }
}

/// Client side of the Init1 exchange.
#[derive(Debug)]
pub struct Init1Machine {
    version: u32,
    random: [u8; 4],
    state: State,
}

impl Init1Machine {
    /// Create a machine with the client version constant and a fresh
    /// random value for the echo check.
    #[must_use]
    pub fn new(version: u32, random: [u8; 4]) -> Self {
        Self {
            version,
            random,
            state: State::AwaitingCookie,
        }
    }

    /// The opening step-0 payload.
    #[must_use]
    pub fn step0(&self, timestamp: u32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(21);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend_from_slice(&self.random);
        payload.extend_from_slice(&[0u8; 8]);
        payload
    }

    /// Whether step 4 went out.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one server Init1 payload.
    ///
    /// `init_command` is the encoded command appended to step 4;
    /// `timestamp` is only used when a cookie refresh restarts the
    /// exchange.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] on any length, ordering or puzzle
    /// violation. All of them are fatal for the handshake.
    pub fn handle(
        &mut self,
        payload: &[u8],
        init_command: &[u8],
        timestamp: u32,
    ) -> Result<Init1Reply, HandshakeError> {
        let step = *payload.first().ok_or(HandshakeError::Empty)?;
        match step {
            0x7F => {
                if payload.len() != REFRESH_LEN {
                    return Err(HandshakeError::WrongLength {
                        step,
                        actual: payload.len(),
                    });
                }
                self.state = State::AwaitingCookie;
                Ok(Init1Reply::Send(self.step0(timestamp)))
            }
            1 => {
                self.expect(State::AwaitingCookie, step)?;
                if payload.len() != STEP1_LEN {
                    return Err(HandshakeError::WrongLength {
                        step,
                        actual: payload.len(),
                    });
                }
                let mut reversed = self.random;
                reversed.reverse();
                if payload[1..5] != reversed {
                    return Err(HandshakeError::RandomMismatch);
                }

                let mut reply = Vec::with_capacity(25);
                reply.extend_from_slice(&self.version.to_be_bytes());
                reply.push(2);
                reply.extend_from_slice(&payload[5..21]);
                reply.extend_from_slice(&reversed);
                self.state = State::AwaitingPuzzle;
                Ok(Init1Reply::Send(reply))
            }
            3 => {
                self.expect(State::AwaitingPuzzle, step)?;
                if payload.len() != STEP3_LEN {
                    return Err(HandshakeError::WrongLength {
                        step,
                        actual: payload.len(),
                    });
                }
                let mut x = [0u8; puzzle::PUZZLE_INT_SIZE];
                let mut n = [0u8; puzzle::PUZZLE_INT_SIZE];
                x.copy_from_slice(&payload[1..65]);
                n.copy_from_slice(&payload[65..129]);
                let level =
                    u32::from_be_bytes([payload[129], payload[130], payload[131], payload[132]]);
                let y = puzzle::solve(&x, &n, level)?;

                let mut reply = Vec::with_capacity(297 + init_command.len());
                reply.push(4);
                reply.extend_from_slice(&payload[1..STEP3_LEN]);
                reply.extend_from_slice(&y);
                reply.extend_from_slice(init_command);
                self.state = State::Done;
                Ok(Init1Reply::Finish(reply))
            }
            got => Err(HandshakeError::UnexpectedStep {
                expected: self.state.expected_step(),
                got,
            }),
        }
    }

    fn expect(&self, state: State, got: u8) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::UnexpectedStep {
                expected: self.state.expected_step(),
                got,
            })
        }
    }
}
