use crate::server::connector::{BalancedChannel, ServiceConnector};
use grin_account_core::proto::captcha::{
    Purpose, VerifyReq, captcha_service_client::CaptchaServiceClient,
};
use tonic::Status;

/// Checks a captcha answer for a given purpose.
#[tonic::async_trait]
pub trait CaptchaVerifier: Send + Sync + 'static {
    /// `Ok(false)` means the answer is wrong; `Err` means the check itself
    /// could not be performed.
    async fn verify(&self, key: &str, value: &str, purpose: Purpose) -> Result<bool, Status>;
}

/// `captcha.CaptchaService` reached through a balanced channel.
#[derive(Clone)]
pub struct RemoteCaptcha {
    client: CaptchaServiceClient<BalancedChannel>,
}

impl RemoteCaptcha {
    pub fn new(channel: BalancedChannel) -> Self {
        Self {
            client: CaptchaServiceClient::new(channel),
        }
    }

    /// Resolves and dials `service` through `connector`.
    pub async fn connect(
        connector: &ServiceConnector,
        service: &str,
    ) -> grin_account_core::Result<Self> {
        Ok(Self::new(connector.connect(service).await?))
    }
}

#[tonic::async_trait]
impl CaptchaVerifier for RemoteCaptcha {
    async fn verify(&self, key: &str, value: &str, purpose: Purpose) -> Result<bool, Status> {
        let request = VerifyReq {
            key: key.to_string(),
            value: value.to_string(),
            purpose: purpose.into(),
        };
        let response = self.client.clone().verify(request).await?;
        Ok(response.into_inner().success)
    }
}
