//! Rendezvous session token generation.

use rand::distr::{Alphanumeric, SampleString};

const SESSION_TOKEN_LEN: usize = 32;

/// Generate a random, unguessable session token.
pub fn new_session_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SESSION_TOKEN_LEN)
}
