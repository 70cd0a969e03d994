//! SCRAM-SHA-256 client flow (RFC 5802 / RFC 7677).
//!
//! Modeled as a three-step state machine matching the three server
//! messages the authentication loop sees: begin -> server-first ->
//! server-final. The SASL username is sent empty; PostgreSQL ignores it
//! and authenticates the user from the startup packet, which also sidesteps
//! SASLprep of the name. Channel binding is not offered (`n,,`): the
//! upstream link carries no TLS to bind to.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{EdgeError, Result};

/// base64 of the `n,,` GS2 header, echoed in the client-final message.
const GS2_HEADER_B64: &str = "biws";

/// State carried between authentication messages.
enum State {
    /// client-first sent; waiting for the server's nonce/salt/rounds.
    FirstSent {
        nonce: String,
        client_first_bare: String,
    },
    /// client-final sent; waiting for the server signature.
    FinalSent {
        auth_message: String,
        salted_password: [u8; 32],
    },
    Done,
}

/// One SCRAM exchange against the upstream.
pub(crate) struct ScramFlow {
    state: State,
}

impl ScramFlow {
    /// Start an exchange. Returns the flow and the client-first message to
    /// wrap in a SASLInitialResponse.
    pub(crate) fn begin() -> (Self, String) {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::begin_with_nonce(B64.encode(raw))
    }

    fn begin_with_nonce(nonce: String) -> (Self, String) {
        let client_first_bare = format!("n=,r={nonce}");
        let message = format!("n,,{client_first_bare}");
        let flow = Self {
            state: State::FirstSent {
                nonce,
                client_first_bare,
            },
        };
        (flow, message)
    }

    /// Consume the server-first message and produce the client-final
    /// message carrying the proof.
    pub(crate) fn server_first(&mut self, password: &str, message: &str) -> Result<String> {
        let State::FirstSent {
            nonce,
            client_first_bare,
        } = &self.state
        else {
            return Err(EdgeError::Protocol(
                "SASL continue outside the SCRAM exchange".into(),
            ));
        };

        let server_nonce = attr(message, 'r')
            .ok_or_else(|| EdgeError::Auth("server-first message carries no nonce".into()))?;
        if !server_nonce.starts_with(nonce.as_str()) {
            return Err(EdgeError::Auth(
                "server nonce does not extend ours".into(),
            ));
        }
        let salt = attr(message, 's')
            .ok_or_else(|| EdgeError::Auth("server-first message carries no salt".into()))
            .and_then(|b64| {
                B64.decode(b64)
                    .map_err(|e| EdgeError::Auth(format!("undecodable SCRAM salt: {e}")))
            })?;
        let rounds: u32 = attr(message, 'i')
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| EdgeError::Auth("bad SCRAM iteration count".into()))?;

        let without_proof = format!("c={GS2_HEADER_B64},r={server_nonce}");
        let auth_message = format!("{client_first_bare},{message},{without_proof}");

        let salted_password = salt_password(password.as_bytes(), &salt, rounds);
        let client_key = mac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = mac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature)
            .map(|(key, sig)| key ^ sig)
            .collect();

        let reply = format!("{without_proof},p={}", B64.encode(proof));
        self.state = State::FinalSent {
            auth_message,
            salted_password,
        };
        Ok(reply)
    }

    /// Verify the server-final signature; mutual authentication fails if the
    /// upstream cannot prove it knows the password verifier.
    pub(crate) fn server_final(&mut self, message: &str) -> Result<()> {
        let State::FinalSent {
            auth_message,
            salted_password,
        } = &self.state
        else {
            return Err(EdgeError::Protocol(
                "SASL final outside the SCRAM exchange".into(),
            ));
        };

        let verifier = attr(message, 'v')
            .ok_or_else(|| EdgeError::Auth("server-final message carries no signature".into()))?;
        let claimed = B64
            .decode(verifier.trim())
            .map_err(|e| EdgeError::Auth(format!("undecodable server signature: {e}")))?;

        let server_key = mac(salted_password, b"Server Key");
        let expected = mac(&server_key, auth_message.as_bytes());
        if claimed != expected {
            return Err(EdgeError::Auth(
                "server signature mismatch, upstream is not who it claims".into(),
            ));
        }
        self.state = State::Done;
        Ok(())
    }
}

/// Pull a single-letter attribute (`r=`, `s=`, `i=`, `v=`) out of a
/// comma-separated SCRAM message.
fn attr(message: &str, key: char) -> Option<&str> {
    message.split(',').find_map(|part| {
        let (k, v) = part.split_once('=')?;
        (k.len() == 1 && k.starts_with(key)).then_some(v)
    })
}

/// Hi() from RFC 5802: iterated salted HMAC, folded with XOR.
fn salt_password(password: &[u8], salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut prev = mac(password, &block);
    let mut out = prev;
    for _ in 1..rounds {
        prev = mac(password, &prev);
        for (acc, byte) in out.iter_mut().zip(prev) {
            *acc ^= byte;
        }
    }
    out
}

fn mac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut m = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    m.update(data);
    m.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_first_sends_empty_username() {
        let (_, message) = ScramFlow::begin();
        assert!(message.starts_with("n,,n=,r="));
        // 18 random bytes -> 24 base64 chars of nonce
        assert_eq!(message.len(), "n,,n=,r=".len() + 24);
    }

    #[test]
    fn attr_parses_scram_pairs() {
        let msg = "r=abc=def,s=Zm9v,i=4096";
        assert_eq!(attr(msg, 'r'), Some("abc=def"));
        assert_eq!(attr(msg, 's'), Some("Zm9v"));
        assert_eq!(attr(msg, 'i'), Some("4096"));
        assert_eq!(attr(msg, 'v'), None);
    }

    #[test]
    fn rejects_server_nonce_that_drops_ours() {
        let (mut flow, _) = ScramFlow::begin_with_nonce("clientnonce".into());
        let err = flow
            .server_first("pw", "r=othernonce,s=Zm9v,i=4096")
            .unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn rejects_malformed_server_first() {
        let (mut flow, _) = ScramFlow::begin_with_nonce("n".into());
        assert!(flow.server_first("pw", "s=Zm9v,i=4096").is_err());
        let (mut flow, _) = ScramFlow::begin_with_nonce("n".into());
        assert!(flow.server_first("pw", "r=nx,i=4096").is_err());
        let (mut flow, _) = ScramFlow::begin_with_nonce("n".into());
        assert!(flow.server_first("pw", "r=nx,s=Zm9v,i=lots").is_err());
    }

    #[test]
    fn rejects_forged_server_signature() {
        let (mut flow, _) = ScramFlow::begin_with_nonce("n".into());
        flow.server_first("pw", "r=nx,s=Zm9v,i=64").unwrap();
        let err = flow.server_final("v=AAAA").unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn out_of_order_messages_are_protocol_errors() {
        let (mut flow, _) = ScramFlow::begin();
        assert!(matches!(
            flow.server_final("v=AAAA"),
            Err(EdgeError::Protocol(_))
        ));

        let (mut flow, _) = ScramFlow::begin_with_nonce("n".into());
        flow.server_first("pw", "r=nx,s=Zm9v,i=64").unwrap();
        assert!(matches!(
            flow.server_first("pw", "r=nx,s=Zm9v,i=64"),
            Err(EdgeError::Protocol(_))
        ));
    }
}
