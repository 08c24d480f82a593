use grin_account_core::{AuthError, Error, token::Claims};
use tonic::{Request, Status};

/// Access to the claims the authentication stage attached to a call.
pub trait ClaimsExt {
    /// The verified claims, or `UNAUTHENTICATED` if the call carries none
    /// (an exempt method, or a request that bypassed the chain).
    fn claims(&self) -> Result<&Claims, Status>;
}

impl<T> ClaimsExt for Request<T> {
    fn claims(&self) -> Result<&Claims, Status> {
        self.extensions()
            .get::<Claims>()
            .ok_or_else(|| Error::Unauthenticated(AuthError::MissingToken).into())
    }
}
