//! gRPC service implementation for account sign-up, sign-in and password
//! reset.
//!
//! This module defines [`AccountService`], the concrete implementation of
//! the `account.UserService` gRPC service. `SignUp` and `SignIn` are callable
//! without a token (see [`AuthExempt`]); `ResetPasswd` acts on the account
//! named by the verified token.
//!
//! ## Responsibilities
//!
//! - Validate usernames, contacts and passwords.
//! - Check captcha answers with the captcha service.
//! - Hash and verify passwords off the async runtime.
//! - Issue bearer tokens on successful sign-in.

use super::{
    captcha::CaptchaVerifier,
    contact::Contact,
    password::PasswordHasher,
    store::{UserRecord, UserStore},
};
use crate::server::interceptor::{AuthExempt, ClaimsExt};
use grin_account_core::{
    Error,
    proto::{
        account::{
            ResetPasswdReq, ResetPasswdRsp, SignInReq, SignInRsp, SignUpReq, SignUpRsp,
            user_service_server::UserService,
        },
        captcha::Purpose,
    },
    token::TokenCodec,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

const USERNAME_LEN: core::ops::RangeInclusive<usize> = 3..=24;
const MIN_PASSWORD_LEN: usize = 8;

/// Message returned for an unknown account or a wrong password alike.
const SIGN_IN_REJECTED: &str = "account not found";

/// The `account.UserService` handler.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct AccountService {
    codec: TokenCodec,
    store: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    captcha: Arc<dyn CaptchaVerifier>,
}

impl AccountService {
    pub fn new(
        codec: TokenCodec,
        store: Arc<dyn UserStore>,
        hasher: Arc<dyn PasswordHasher>,
        captcha: Arc<dyn CaptchaVerifier>,
    ) -> Self {
        Self {
            codec,
            store,
            hasher,
            captcha,
        }
    }

    /// The codec tokens are issued with; the interceptor chain verifies with
    /// the same one.
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    async fn check_captcha(&self, key: &str, value: &str, purpose: Purpose) -> Result<(), Status> {
        match self.captcha.verify(key, value, purpose).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::invalid("captcha invalid").into()),
            Err(status) => Err(Error::fault(format!("captcha verify error: {status}")).into()),
        }
    }

    async fn hash_password(&self, password: String) -> Result<String, Error> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| Error::fault(format!("password hashing task failed: {e}")))?
    }

    async fn verify_password(&self, password: String, hash: String) -> Result<bool, Error> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| Error::fault(format!("password verification task failed: {e}")))?
    }
}

impl AuthExempt for AccountService {
    fn auth_exempt_methods(&self) -> &'static [&'static str] {
        &["SignUp", "SignIn"]
    }
}

fn check_password(password: &str) -> Result<(), Error> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::invalid(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn parse_contact(raw: &str) -> Result<Contact, Error> {
    Contact::parse(raw).ok_or_else(|| Error::invalid("contact invalid"))
}

#[tonic::async_trait]
impl UserService for AccountService {
    #[tracing::instrument(skip_all, fields(username = %request.get_ref().username))]
    async fn sign_up(&self, request: Request<SignUpReq>) -> Result<Response<SignUpRsp>, Status> {
        let req = request.into_inner();

        if !USERNAME_LEN.contains(&req.username.chars().count()) {
            return Err(Error::invalid(format!(
                "username must be {} to {} characters",
                USERNAME_LEN.start(),
                USERNAME_LEN.end()
            ))
            .into());
        }
        let contact = parse_contact(&req.contact)?;
        check_password(&req.password)?;

        self.check_captcha(&req.contact, &req.captcha, Purpose::SignUp)
            .await?;

        let password_hash = self.hash_password(req.password).await?;
        let (email, phone_number) = match contact {
            Contact::Email(email) => (Some(email), None),
            Contact::Phone(phone) => (None, Some(phone)),
        };
        self.store
            .create_if_unique(UserRecord {
                username: req.username,
                email,
                phone_number,
                password_hash,
            })
            .await?;

        tracing::info!("account created");
        Ok(Response::new(SignUpRsp {
            success: true,
            message: "Sign Up!".to_string(),
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn sign_in(&self, request: Request<SignInReq>) -> Result<Response<SignInRsp>, Status> {
        let peer_ip = request.remote_addr().map(|addr| addr.ip().to_string());
        let req = request.into_inner();

        self.check_captcha(&req.key, &req.value, Purpose::SignIn)
            .await?;
        let contact = parse_contact(&req.contact)?;

        let Some(user) = self.store.find(&contact.query()).await? else {
            tracing::warn!("sign-in for unknown contact");
            return Err(Status::unauthenticated(SIGN_IN_REJECTED));
        };
        if !self
            .verify_password(req.password, user.password_hash)
            .await?
        {
            tracing::warn!(username = %user.username, "sign-in with wrong password");
            return Err(Status::unauthenticated(SIGN_IN_REJECTED));
        }

        let token = self.codec.issue_for(&user.username, peer_ip.as_deref())?;
        tracing::info!(username = %user.username, "signed in");
        Ok(Response::new(SignInRsp { token }))
    }

    #[tracing::instrument(skip_all)]
    async fn reset_passwd(
        &self,
        request: Request<ResetPasswdReq>,
    ) -> Result<Response<ResetPasswdRsp>, Status> {
        let subject = request.claims()?.subject.clone();
        let req = request.into_inner();

        check_password(&req.password)?;
        if !req.contact.is_empty() {
            let contact = parse_contact(&req.contact)?;
            let owner = self.store.find(&contact.query()).await?;
            if owner.is_none_or(|u| u.username != subject) {
                return Err(Error::invalid("contact does not belong to this account").into());
            }
        }

        let password_hash = self.hash_password(req.password).await?;
        self.store.update_password(&subject, password_hash).await?;

        tracing::info!(username = %subject, "password reset");
        Ok(Response::new(ResetPasswdRsp { success: true }))
    }
}
