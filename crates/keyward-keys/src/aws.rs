//! AWS Secrets Manager custodian.
//!
//! Custodian keys live as secrets named `{prefix}-{name}`; the secret ARN is
//! the canonical key id recorded in policies. Resolution only reads — no
//! secret is ever created or modified from here.

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client;

use keyward_core::error::{KeywardError, Result};

use crate::managed::ManagedKeySystemView;

/// AWS Secrets Manager-backed managed-key custodian.
pub struct AwsCustodian {
    client: Client,
    prefix: String,
    region: String,
}

impl AwsCustodian {
    /// Connect to AWS Secrets Manager.
    ///
    /// Uses the default credential chain (env vars, AWS CLI profile, IAM
    /// role, etc.).
    pub async fn new(region: &str, prefix: Option<&str>) -> anyhow::Result<Self> {
        let region_provider = aws_config::Region::new(region.to_string());
        let config = aws_config::from_env().region(region_provider).load().await;
        let client = Client::new(&config);

        Ok(Self {
            client,
            prefix: prefix.unwrap_or("keyward-key").to_string(),
            region: region.to_string(),
        })
    }

    fn secret_name(&self, name: &str) -> String {
        format!("{}-{}", self.prefix, name)
    }

    /// Region used by this custodian.
    pub fn region(&self) -> &str {
        &self.region
    }

    async fn arn_for(&self, secret_id: &str, reference: &str) -> Result<String> {
        let resp = self
            .client
            .describe_secret()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| {
                let msg = format!("{e}");
                if msg.contains("ResourceNotFoundException") {
                    KeywardError::ManagedKeyNotFound(reference.to_string())
                } else {
                    KeywardError::Internal(format!("AWS describe_secret({secret_id}) failed: {e}"))
                }
            })?;

        resp.arn()
            .map(|a| a.to_string())
            .ok_or_else(|| KeywardError::Internal(format!("Secret {secret_id} has no ARN")))
    }
}

#[async_trait]
impl ManagedKeySystemView for AwsCustodian {
    async fn resolve_managed_key_id(
        &self,
        backend_id: &str,
        name: Option<&str>,
        id: Option<&str>,
    ) -> Result<String> {
        let arn = match (name, id) {
            (Some(name), _) => self.arn_for(&self.secret_name(name), name).await?,
            (None, Some(id)) => self.arn_for(id, id).await?,
            (None, None) => {
                return Err(KeywardError::InvalidRequest(
                    "Either the managed key name or id must be provided".to_string(),
                ));
            }
        };

        if let (Some(name), Some(id)) = (name, id) {
            if arn != id {
                return Err(KeywardError::InvalidRequest(format!(
                    "Managed key name {name} and id {id} identify different keys"
                )));
            }
        }

        tracing::debug!(
            backend_id = %backend_id,
            region = %self.region,
            "Resolved managed key via AWS Secrets Manager"
        );
        Ok(arn)
    }
}
