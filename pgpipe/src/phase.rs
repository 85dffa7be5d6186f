//! Startup phase: startup message, authentication, and backend parameters
//! until the first `ReadyForQuery`.
use std::fmt;

/// The server requested an authentication method this client does not implement.
#[derive(Clone, PartialEq, Eq)]
pub struct UnsupportedAuth {
    pub(crate) method: &'static str,
}

impl UnsupportedAuth {
    pub fn method(&self) -> &'static str {
        self.method
    }
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication method `{}` is not supported", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(feature = "tokio")]
pub(crate) use startup_impl::startup;

#[cfg(feature = "tokio")]
mod startup_impl {
    use super::UnsupportedAuth;
    use crate::{
        Result,
        auth::{self, SaslError, md5::md5_password},
        common::{debug, span, verbose, warning},
        connection::{Config, Connection, ConnectionState},
        error::DatabaseError,
        net::Transport,
        postgres::{
            BackendMessage,
            backend::Authentication,
            frontend::{PasswordMessage, SaslInitialResponse, SaslResponse, Startup},
        },
    };

    /// Send the startup message and drive the connection until it is [`Idle`][ConnectionState::Idle].
    ///
    /// On error the connection is [`Ended`][ConnectionState::Ended].
    pub(crate) async fn startup<T: Transport>(conn: &mut Connection<T>, config: &Config) -> Result<()> {
        span!("startup");

        let result = handshake(conn, config).await;
        if result.is_err() {
            conn.set_state(ConnectionState::Ended);
        }
        result
    }

    async fn handshake<T: Transport>(conn: &mut Connection<T>, config: &Config) -> Result<()> {
        config.validate()?;

        let params = config.startup_params();
        let params = params.iter().map(|(k, v)| (*k, v.as_ref())).collect::<Vec<_>>();
        conn.send_startup(Startup { user: &config.user, params: &params });
        conn.flush().await?;
        conn.set_state(ConnectionState::Connecting);

        loop {
            match conn.recv().await? {
                BackendMessage::Authentication(auth) => {
                    authenticate(conn, config, auth)?;
                    conn.flush().await?;
                },
                BackendMessage::BackendKeyData(key) if conn.state() == ConnectionState::BackendKeyWait => {
                    conn.set_backend_key_data(key);
                },
                BackendMessage::ParameterStatus(param) if conn.state() == ConnectionState::BackendKeyWait => {
                    verbose!(name = %param.name, value = %param.value, "parameter status");
                    conn.set_parameter(param.name, param.value);
                },
                BackendMessage::NoticeResponse(_notice) => {
                    warning!("{}", *_notice);
                },
                BackendMessage::NegotiateProtocolVersion(_negotiate) => {
                    debug!(
                        "server supports protocol minor version {}, unrecognized options: {:?}",
                        _negotiate.minor, _negotiate.options,
                    );
                },
                BackendMessage::ErrorResponse(err) => {
                    return Err(DatabaseError::startup(err).into());
                },
                BackendMessage::ReadyForQuery(_) if conn.state() == ConnectionState::BackendKeyWait => {
                    conn.set_state(ConnectionState::Idle);
                    return Ok(());
                },
                message => return Err(message.unexpected("startup").into()),
            }
        }
    }

    fn authenticate<T: Transport>(
        conn: &mut Connection<T>,
        config: &Config,
        auth: Authentication,
    ) -> Result<()> {
        let state = conn.state();
        let accepts_request = matches!(state, ConnectionState::Connecting);

        match auth {
            Authentication::Ok if state == ConnectionState::Connecting || state.is_authenticating() => {
                if conn.sasl.is_some() {
                    // server skipped SASLFinal, its signature was never verified
                    return Err(SaslError::OutOfOrder("AuthenticationOk received before server-final-message").into());
                }
                conn.set_state(ConnectionState::BackendKeyWait);
            },
            Authentication::CleartextPassword if accepts_request => {
                verbose!("cleartext password authentication");
                conn.send(PasswordMessage { password: &config.pass });
                conn.set_state(ConnectionState::AuthenticatingCleartext);
            },
            Authentication::MD5Password { salt } if accepts_request => {
                verbose!("md5 password authentication");
                let password = md5_password(&config.user, &config.pass, salt);
                conn.send(PasswordMessage { password: &password });
                conn.set_state(ConnectionState::AuthenticatingMD5);
            },
            Authentication::SASL { mechanisms } if accepts_request => {
                let channel_binding = conn.transport().peer_certificate_der().is_some();
                let (session, client_first) = auth::start_session(&mechanisms, channel_binding)?;
                debug!("sasl authentication using {}", session.mechanism().name());
                conn.send(SaslInitialResponse {
                    mechanism: session.mechanism().name(),
                    data: &client_first,
                });
                conn.sasl = Some(session);
                conn.set_state(ConnectionState::AuthenticatingSASL);
            },
            Authentication::SASLContinue { data } if state == ConnectionState::AuthenticatingSASL => {
                let Some(session) = conn.sasl.take() else {
                    return Err(SaslError::OutOfOrder("SASLContinue received without a session").into());
                };
                let peer_certificate = conn.transport().peer_certificate_der();
                let (session, client_final) =
                    auth::continue_session(session, &config.pass, &data, peer_certificate)?;
                conn.send(SaslResponse { data: &client_final });
                conn.sasl = Some(session);
            },
            Authentication::SASLFinal { data } if state == ConnectionState::AuthenticatingSASL => {
                let Some(session) = conn.sasl.take() else {
                    return Err(SaslError::OutOfOrder("SASLFinal received without a session").into());
                };
                auth::finalize_session(session, &data)?;
                verbose!("server signature verified");
            },
            Authentication::SASLContinue { .. } | Authentication::SASLFinal { .. } => {
                return Err(SaslError::OutOfOrder("SASL message received outside of a SASL exchange").into());
            },
            Authentication::KerberosV5
            | Authentication::GSS
            | Authentication::GSSContinue { .. }
            | Authentication::SSPI
            | Authentication::Unsupported { .. } => {
                return Err(UnsupportedAuth { method: auth.method_name() }.into());
            },
            _ => {
                return Err(crate::postgres::ProtocolError::unexpected_phase(b'R', "authentication").into());
            },
        }

        Ok(())
    }

}
