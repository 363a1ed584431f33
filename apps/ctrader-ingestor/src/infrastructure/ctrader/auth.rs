//! Open API Authentication
//!
//! The Open API authenticates in two steps over the same socket, before
//! any market data request is accepted.
//!
//! # Authentication Flow
//!
//! 1. Connect (TCP, usually TLS)
//! 2. Send `ProtoOAApplicationAuthReq{clientId, clientSecret}`
//! 3. Receive `ProtoOAApplicationAuthRes`
//! 4. Send `ProtoOAAccountAuthReq{ctidTraderAccountId, accessToken}`
//! 5. Receive `ProtoOAAccountAuthRes`
//!
//! ## Account Not Found
//!
//! If step 4 is rejected with `CH_CTID_TRADER_ACCOUNT_NOT_FOUND`, the
//! handler asks which accounts the token does grant access to and fails
//! with [`AuthError::AccountNotFound`] listing them, so a misconfigured
//! account id is diagnosable from the log alone.
//!
//! # References
//!
//! - [Application auth](https://help.ctrader.com/open-api/account-authentication/)

use thiserror::Error;

use super::codec::{BrokerError, OutboundMessage};
use super::messages::{
    ProtoOaAccountAuthReq, ProtoOaApplicationAuthReq, ProtoOaGetAccountListByAccessTokenReq,
    ProtoOaGetAccountListByAccessTokenRes,
};

// =============================================================================
// Error Types
// =============================================================================

/// Invalid credential values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    /// A required value was empty.
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    /// The account id contained no digits.
    #[error("account id {0:?} contains no digits")]
    InvalidAccountId(String),
}

/// Errors that end the authentication flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Application credentials rejected.
    #[error("application auth rejected: {0}")]
    ApplicationRejected(BrokerError),

    /// Account credentials rejected.
    #[error("account auth rejected: {0}")]
    AccountRejected(BrokerError),

    /// The account id is not accessible with this token.
    #[error("account {requested} not found; token grants access to {available:?}")]
    AccountNotFound {
        /// Account id that was configured.
        requested: i64,
        /// Account ids the token can access.
        available: Vec<u64>,
    },

    /// A response arrived that does not fit the current state.
    #[error("unexpected {received} while {state:?}")]
    UnexpectedMessage {
        /// State when the message arrived.
        state: AuthState,
        /// What arrived.
        received: &'static str,
    },
}

// =============================================================================
// Authentication State
// =============================================================================

/// Current state of authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Not started.
    #[default]
    Idle,

    /// Application auth request sent.
    AwaitingAppAuth,

    /// Account auth request sent.
    AwaitingAccountAuth,

    /// Account rejected; waiting for the accounts the token can access.
    AwaitingAccountList,

    /// Both steps completed.
    Authenticated,

    /// Authentication failed.
    Failed,
}

impl AuthState {
    /// Check if authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    /// Check if a response is still expected.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::AwaitingAppAuth | Self::AwaitingAccountAuth | Self::AwaitingAccountList
        )
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Open API credentials.
///
/// `Debug` redacts the client secret and the access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
    access_token: String,
    account_id: i64,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// The account id is reduced to its digits, so `"ACC-12 345"` becomes
    /// `12345`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is empty or the account id has no
    /// digits.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        access_token: impl Into<String>,
        account_id: &str,
    ) -> Result<Self, CredentialsError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let access_token = access_token.into();

        if client_id.is_empty() {
            return Err(CredentialsError::Empty("client id"));
        }
        if client_secret.is_empty() {
            return Err(CredentialsError::Empty("client secret"));
        }
        if access_token.is_empty() {
            return Err(CredentialsError::Empty("access token"));
        }

        let digits: String = account_id.chars().filter(char::is_ascii_digit).collect();
        let account_id = digits
            .parse::<i64>()
            .map_err(|_| CredentialsError::InvalidAccountId(account_id.to_string()))?;

        Ok(Self {
            client_id,
            client_secret,
            access_token,
            account_id,
        })
    }

    /// Application client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// OAuth access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Normalized trading account id.
    #[must_use]
    pub const fn account_id(&self) -> i64 {
        self.account_id
    }

    fn application_auth(&self) -> OutboundMessage {
        OutboundMessage::ApplicationAuth(ProtoOaApplicationAuthReq {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        })
    }

    fn account_auth(&self) -> OutboundMessage {
        OutboundMessage::AccountAuth(ProtoOaAccountAuthReq {
            ctid_trader_account_id: self.account_id,
            access_token: self.access_token.clone(),
        })
    }

    fn account_list(&self) -> OutboundMessage {
        OutboundMessage::AccountList(ProtoOaGetAccountListByAccessTokenReq {
            access_token: self.access_token.clone(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .finish()
    }
}

// =============================================================================
// Authentication Handler
// =============================================================================

/// What the session should do after feeding the handler a message.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthStep {
    /// Send this request and keep waiting.
    Send(OutboundMessage),
    /// Authentication completed.
    Complete,
    /// Authentication failed.
    Failed(AuthError),
}

/// Drives the two-step authentication for one connection.
///
/// # Example
///
/// ```rust
/// use ctrader_ingestor::infrastructure::ctrader::auth::{AuthHandler, AuthStep, Credentials};
///
/// let creds = Credentials::new("id", "secret", "token", "12345").unwrap();
/// let mut handler = AuthHandler::new(creds);
///
/// handler.start();
/// assert!(matches!(handler.on_application_auth(), AuthStep::Send(_)));
/// assert_eq!(handler.on_account_auth(12345), AuthStep::Complete);
/// assert!(handler.state().is_authenticated());
/// ```
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a new handler.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Credentials in use.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Begin authenticating; returns the application auth request.
    pub fn start(&mut self) -> OutboundMessage {
        self.state = AuthState::AwaitingAppAuth;
        self.credentials.application_auth()
    }

    /// Application auth response received.
    pub fn on_application_auth(&mut self) -> AuthStep {
        if self.state != AuthState::AwaitingAppAuth {
            return self.unexpected("application auth response");
        }

        self.state = AuthState::AwaitingAccountAuth;
        AuthStep::Send(self.credentials.account_auth())
    }

    /// Account auth response received.
    pub fn on_account_auth(&mut self, account_id: i64) -> AuthStep {
        if self.state != AuthState::AwaitingAccountAuth {
            return self.unexpected("account auth response");
        }

        if account_id != self.credentials.account_id {
            tracing::warn!(
                requested = self.credentials.account_id,
                authenticated = account_id,
                "Broker authenticated a different account id"
            );
        }

        self.state = AuthState::Authenticated;
        AuthStep::Complete
    }

    /// Error response received during authentication.
    pub fn on_error(&mut self, error: BrokerError) -> AuthStep {
        match self.state {
            AuthState::AwaitingAccountAuth if error.is_account_not_found() => {
                tracing::warn!(
                    account_id = self.credentials.account_id,
                    code = %error.code,
                    "Account not found, listing accounts for the access token"
                );
                self.state = AuthState::AwaitingAccountList;
                AuthStep::Send(self.credentials.account_list())
            }
            AuthState::AwaitingAppAuth => self.fail(AuthError::ApplicationRejected(error)),
            _ => self.fail(AuthError::AccountRejected(error)),
        }
    }

    /// Account list received after an account-not-found rejection.
    pub fn on_account_list(&mut self, res: &ProtoOaGetAccountListByAccessTokenRes) -> AuthStep {
        if self.state != AuthState::AwaitingAccountList {
            return self.unexpected("account list response");
        }

        let available = res
            .ctid_trader_account
            .iter()
            .map(|account| account.ctid_trader_account_id)
            .collect();

        self.fail(AuthError::AccountNotFound {
            requested: self.credentials.account_id,
            available,
        })
    }

    /// Reset after the connection closes.
    pub const fn reset(&mut self) {
        self.state = AuthState::Idle;
    }

    fn fail(&mut self, error: AuthError) -> AuthStep {
        self.state = AuthState::Failed;
        AuthStep::Failed(error)
    }

    fn unexpected(&mut self, received: &'static str) -> AuthStep {
        let state = self.state;
        self.fail(AuthError::UnexpectedMessage { state, received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ctrader::messages::ProtoOaCtidTraderAccount;

    fn credentials() -> Credentials {
        Credentials::new("client", "secret", "token", "12345").unwrap()
    }

    fn broker_error(code: &str) -> BrokerError {
        BrokerError {
            code: code.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_account_id_normalized_to_digits() {
        let creds = Credentials::new("client", "secret", "token", "ACC-12 345").unwrap();
        assert_eq!(creds.account_id(), 12345);
    }

    #[test]
    fn test_account_id_without_digits_fails() {
        let result = Credentials::new("client", "secret", "token", "demo");
        assert_eq!(
            result,
            Err(CredentialsError::InvalidAccountId("demo".to_string()))
        );
    }

    #[test]
    fn test_empty_values_fail() {
        assert_eq!(
            Credentials::new("", "secret", "token", "1"),
            Err(CredentialsError::Empty("client id"))
        );
        assert_eq!(
            Credentials::new("client", "", "token", "1"),
            Err(CredentialsError::Empty("client secret"))
        );
        assert_eq!(
            Credentials::new("client", "secret", "", "1"),
            Err(CredentialsError::Empty("access token"))
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let debug = format!("{:?}", Credentials::new("client", "s3cr3t", "t0k3n", "1").unwrap());
        assert!(debug.contains("client"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cr3t"));
        assert!(!debug.contains("t0k3n"));
    }

    #[test]
    fn test_happy_path() {
        let mut handler = AuthHandler::new(credentials());
        assert_eq!(handler.state(), AuthState::Idle);

        let first = handler.start();
        assert!(matches!(first, OutboundMessage::ApplicationAuth(ref req) if req.client_id == "client"));
        assert_eq!(handler.state(), AuthState::AwaitingAppAuth);

        let AuthStep::Send(OutboundMessage::AccountAuth(req)) = handler.on_application_auth() else {
            panic!("expected account auth request");
        };
        assert_eq!(req.ctid_trader_account_id, 12345);
        assert_eq!(req.access_token, "token");
        assert_eq!(handler.state(), AuthState::AwaitingAccountAuth);

        assert_eq!(handler.on_account_auth(12345), AuthStep::Complete);
        assert!(handler.state().is_authenticated());
    }

    #[test]
    fn test_application_rejected() {
        let mut handler = AuthHandler::new(credentials());
        handler.start();

        let step = handler.on_error(broker_error("CH_CLIENT_AUTH_FAILURE"));
        assert!(matches!(
            step,
            AuthStep::Failed(AuthError::ApplicationRejected(ref e)) if e.code == "CH_CLIENT_AUTH_FAILURE"
        ));
        assert_eq!(handler.state(), AuthState::Failed);
    }

    #[test]
    fn test_account_not_found_lists_accounts() {
        let mut handler = AuthHandler::new(credentials());
        handler.start();
        handler.on_application_auth();

        let step = handler.on_error(broker_error("CH_CTID_TRADER_ACCOUNT_NOT_FOUND"));
        assert!(matches!(step, AuthStep::Send(OutboundMessage::AccountList(_))));
        assert!(handler.state().is_in_progress());

        let res = ProtoOaGetAccountListByAccessTokenRes {
            access_token: "token".to_string(),
            permission_scope: None,
            ctid_trader_account: vec![
                ProtoOaCtidTraderAccount {
                    ctid_trader_account_id: 111,
                    is_live: Some(false),
                    trader_login: None,
                },
                ProtoOaCtidTraderAccount {
                    ctid_trader_account_id: 222,
                    is_live: Some(true),
                    trader_login: None,
                },
            ],
        };

        assert_eq!(
            handler.on_account_list(&res),
            AuthStep::Failed(AuthError::AccountNotFound {
                requested: 12345,
                available: vec![111, 222],
            })
        );
    }

    #[test]
    fn test_other_account_error_fails_immediately() {
        let mut handler = AuthHandler::new(credentials());
        handler.start();
        handler.on_application_auth();

        let step = handler.on_error(broker_error("CH_ACCESS_TOKEN_INVALID"));
        assert!(matches!(step, AuthStep::Failed(AuthError::AccountRejected(_))));
    }

    #[test]
    fn test_out_of_order_response_fails() {
        let mut handler = AuthHandler::new(credentials());
        handler.start();

        let step = handler.on_account_auth(12345);
        assert!(matches!(
            step,
            AuthStep::Failed(AuthError::UnexpectedMessage {
                state: AuthState::AwaitingAppAuth,
                ..
            })
        ));
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut handler = AuthHandler::new(credentials());
        handler.start();
        handler.reset();
        assert_eq!(handler.state(), AuthState::Idle);
    }
}
