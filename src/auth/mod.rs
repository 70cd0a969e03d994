//! Authentication against the upstream primary.
//!
//! The listening side of this process is trust-only, but the primary is
//! not: both the replication session and the write-forwarding session must
//! authenticate. Socket reads and writes stay in `upstream`; this module
//! owns the decision of what to answer for each AuthenticationRequest code
//! through [`Authenticator`], one instance per connection attempt.
//!
//! Supported methods: SCRAM-SHA-256 (feature `scram`, default; see
//! [`scram`]), cleartext, and MD5 (feature `md5`, legacy upstreams only).
//! GSSAPI, SSPI, and certificate authentication are not supported.

#[cfg(feature = "scram")]
pub(crate) mod scram;

use crate::error::{EdgeError, Result};

// AuthenticationRequest codes, per the protocol's AuthenticationOk family.
const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
#[cfg(feature = "md5")]
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
#[cfg(feature = "scram")]
const AUTH_SASL_CONTINUE: i32 = 11;
#[cfg(feature = "scram")]
const AUTH_SASL_FINAL: i32 = 12;

#[cfg(feature = "scram")]
const SCRAM_SHA_256: &[u8] = b"SCRAM-SHA-256";

/// Per-connection authentication state machine.
pub struct Authenticator {
    user: String,
    password: String,
    #[cfg(feature = "scram")]
    flow: Option<scram::ScramFlow>,
}

impl Authenticator {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            #[cfg(feature = "scram")]
            flow: None,
        }
    }

    /// React to one AuthenticationRequest. `Some` is the payload of the
    /// PasswordMessage to send back; `None` means there is nothing to send
    /// for this code.
    pub fn step(&mut self, code: i32, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        match code {
            AUTH_OK => Ok(None),
            AUTH_CLEARTEXT => {
                let mut reply = self.password.clone().into_bytes();
                reply.push(0);
                Ok(Some(reply))
            }
            #[cfg(feature = "md5")]
            AUTH_MD5 => {
                let salt = payload
                    .get(..4)
                    .ok_or_else(|| EdgeError::Protocol("md5 auth salt missing".into()))?;
                Ok(Some(md5_response(&self.user, &self.password, salt)))
            }
            AUTH_SASL => self.begin_sasl(payload),
            #[cfg(feature = "scram")]
            AUTH_SASL_CONTINUE => {
                let flow = self.flow.as_mut().ok_or_else(|| {
                    EdgeError::Protocol("SASL continue before SASL start".into())
                })?;
                let message = challenge_utf8(payload)?;
                Ok(Some(flow.server_first(&self.password, message)?.into_bytes()))
            }
            #[cfg(feature = "scram")]
            AUTH_SASL_FINAL => {
                let flow = self.flow.as_mut().ok_or_else(|| {
                    EdgeError::Protocol("SASL final before SASL start".into())
                })?;
                flow.server_final(challenge_utf8(payload)?)?;
                Ok(None)
            }
            other => Err(EdgeError::Auth(format!(
                "unsupported auth method {other} requested for {}",
                self.user
            ))),
        }
    }

    /// Answer an AuthenticationSASL mechanism list with a
    /// SASLInitialResponse: mechanism name, then the length-prefixed
    /// client-first message.
    #[cfg(feature = "scram")]
    fn begin_sasl(&mut self, mechanisms: &[u8]) -> Result<Option<Vec<u8>>> {
        if !mechanisms.split(|&b| b == 0).any(|m| m == SCRAM_SHA_256) {
            return Err(EdgeError::Auth(format!(
                "server offers no SCRAM-SHA-256, only: {}",
                String::from_utf8_lossy(mechanisms).replace('\0', " ")
            )));
        }

        let (flow, client_first) = scram::ScramFlow::begin();
        self.flow = Some(flow);

        let mut reply = Vec::with_capacity(SCRAM_SHA_256.len() + client_first.len() + 8);
        reply.extend_from_slice(SCRAM_SHA_256);
        reply.push(0);
        reply.extend_from_slice(&(client_first.len() as i32).to_be_bytes());
        reply.extend_from_slice(client_first.as_bytes());
        Ok(Some(reply))
    }

    #[cfg(not(feature = "scram"))]
    fn begin_sasl(&mut self, _mechanisms: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(EdgeError::Auth(
            "server requires SASL but SCRAM support is compiled out".into(),
        ))
    }
}

#[cfg(feature = "scram")]
fn challenge_utf8(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|_| EdgeError::Auth("non-utf8 SASL challenge".into()))
}

/// The classic double-md5 response: md5(md5(password || user) || salt).
#[cfg(feature = "md5")]
fn md5_response(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    fn hex(digest: md5::Digest) -> String {
        format!("{digest:x}")
    }
    let stage1 = hex(md5::compute([password.as_bytes(), user.as_bytes()].concat()));
    let stage2 = hex(md5::compute([stage1.as_bytes(), salt].concat()));
    let mut reply = format!("md5{stage2}").into_bytes();
    reply.push(0);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_requires_no_reply() {
        let mut auth = Authenticator::new("app", "hunter2");
        assert_eq!(auth.step(AUTH_OK, &[]).unwrap(), None);
    }

    #[test]
    fn cleartext_sends_terminated_password() {
        let mut auth = Authenticator::new("app", "hunter2");
        assert_eq!(
            auth.step(AUTH_CLEARTEXT, &[]).unwrap(),
            Some(b"hunter2\0".to_vec())
        );
    }

    #[cfg(feature = "scram")]
    #[test]
    fn sasl_start_picks_scram_and_frames_the_initial_response() {
        let mut auth = Authenticator::new("app", "pw");
        let reply = auth
            .step(AUTH_SASL, b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0")
            .unwrap()
            .unwrap();
        assert!(reply.starts_with(b"SCRAM-SHA-256\0"));
        let len = i32::from_be_bytes(reply[14..18].try_into().unwrap()) as usize;
        assert_eq!(len, reply.len() - 18);
        assert!(reply[18..].starts_with(b"n,,"));
    }

    #[cfg(feature = "scram")]
    #[test]
    fn sasl_without_scram_mechanism_is_rejected() {
        let mut auth = Authenticator::new("app", "pw");
        let err = auth.step(AUTH_SASL, b"OAUTHBEARER\0\0").unwrap_err();
        assert!(err.to_string().contains("SCRAM-SHA-256"));
    }

    #[cfg(feature = "scram")]
    #[test]
    fn sasl_continue_needs_a_started_exchange() {
        let mut auth = Authenticator::new("app", "pw");
        assert!(matches!(
            auth.step(AUTH_SASL_CONTINUE, b"r=x,s=Zm9v,i=1"),
            Err(EdgeError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_codes_name_the_user() {
        let mut auth = Authenticator::new("app", "pw");
        let err = auth.step(7, &[]).unwrap_err(); // GSSAPI
        assert!(matches!(err, EdgeError::Auth(_)));
        assert!(err.to_string().contains("app"));
    }

    #[cfg(feature = "md5")]
    #[test]
    fn md5_reply_is_prefixed_and_terminated() {
        let reply = md5_response("app", "pw", &[1, 2, 3, 4]);
        assert!(reply.starts_with(b"md5"));
        assert_eq!(reply.last(), Some(&0));
        // md5 + 32 hex digits + NUL
        assert_eq!(reply.len(), 3 + 32 + 1);
    }
}
