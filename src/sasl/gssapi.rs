//! Kerberos through `cross-krb5` for GSSAPI (RFC 4752) and GSS-SPNEGO.
//!
//! The security layer is always negotiated as "no layer".

use cross_krb5::{ClientCtx, InitiateFlags, K5Ctx, PendingClientCtx, Step};
use tracing::debug;

use super::{Credentials, Mechanism};
use crate::error::{LdapError, Result};

const NO_SECURITY_LAYER: u8 = 0x01;

enum State {
    Start,
    Pending(PendingClientCtx),
    Established(ClientCtx),
    Done,
}

pub struct Gssapi {
    mechanism: Mechanism,
    principal: Option<String>,
    target: String,
    authz_id: Option<String>,
    max_bufsize: u32,
    state: State,
}

fn krb_err(err: impl std::fmt::Display) -> LdapError {
    LdapError::Sasl(format!("Kerberos: {}", err))
}

impl Gssapi {
    pub fn new(mechanism: Mechanism, credentials: &Credentials, host: &str, max_bufsize: u32) -> Result<Self> {
        if let Some(keytab) = &credentials.keytab {
            // MIT and Heimdal read the client keytab from the environment.
            std::env::set_var("KRB5_CLIENT_KTNAME", keytab);
        }
        let principal = match (&credentials.user, &credentials.realm) {
            (Some(user), Some(realm)) if !user.contains('@') => Some(format!("{}@{}", user, realm)),
            (Some(user), _) => Some(user.clone()),
            (None, _) => None,
        };
        Ok(Self {
            mechanism,
            principal,
            target: format!("ldap/{}", host),
            authz_id: credentials.authz_id.clone(),
            max_bufsize,
            state: State::Start,
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn initial_response(&mut self) -> Result<Vec<u8>> {
        debug!("Initiating {} context for {}", self.mechanism, self.target);
        let (pending, token) =
            ClientCtx::new(InitiateFlags::empty(), self.principal.as_deref(), &self.target, None).map_err(krb_err)?;
        self.state = State::Pending(pending);
        Ok(token.to_vec())
    }

    pub fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Pending(pending) => match pending.step(challenge).map_err(krb_err)? {
                Step::Finished((ctx, token)) => {
                    self.state = State::Established(ctx);
                    Ok(token.map(|t| t.to_vec()).unwrap_or_default())
                }
                Step::Continue((pending, token)) => {
                    self.state = State::Pending(pending);
                    Ok(token.to_vec())
                }
            },
            State::Established(mut ctx) if self.mechanism == Mechanism::Gssapi => {
                let offer = ctx.unwrap(challenge).map_err(krb_err)?;
                if offer.len() != 4 {
                    return Err(LdapError::Sasl("malformed GSSAPI security layer offer".to_string()));
                }
                if offer[0] & NO_SECURITY_LAYER == 0 {
                    return Err(LdapError::Sasl("server requires a GSSAPI security layer".to_string()));
                }
                let mut reply = vec![NO_SECURITY_LAYER];
                reply.extend_from_slice(&self.max_bufsize.to_be_bytes()[1..]);
                if let Some(authz) = &self.authz_id {
                    reply.extend_from_slice(authz.as_bytes());
                }
                let wrapped = ctx.wrap(false, &reply).map_err(krb_err)?;
                Ok(wrapped.to_vec())
            }
            State::Established(ctx) => {
                // SPNEGO completion token; nothing more to send.
                self.state = State::Established(ctx);
                Ok(Vec::new())
            }
            State::Start | State::Done => Err(LdapError::Sasl("unexpected GSSAPI challenge".to_string())),
        }
    }

    /// Consume a trailing token sent with the final success.
    pub fn finish(&mut self, token: &[u8]) -> Result<()> {
        if matches!(self.state, State::Pending(_)) {
            self.step(token)?;
        }
        Ok(())
    }
}
