//! Structured journal messages. We don't link the system journal directly
//! — that's host-application territory — but we emit the same message ID
//! and field set as `tracing` key-value pairs so a `tracing-journald`
//! subscriber (or any other collector) can forward them verbatim.

use tracing::info;

/// `MESSAGE_ID` marking creation of a new deployment.
pub const MESSAGE_ID_DEPLOYMENT: &str = "9bddbda177cd44d891b1b561a8a0ce9e";

/// Fields accompanying [`MESSAGE_ID_DEPLOYMENT`].
#[derive(Debug, Clone)]
pub struct DeploymentJournalFields {
    pub deployment_path: String,
    pub deployment_timestamp: i64,
    pub deployment_device: u64,
    pub deployment_inode: u64,
    pub deployment_checksum: String,
    pub deployment_refspec: Option<String>,
    pub deployment_version: Option<String>,
    pub command_line: Option<String>,
    pub agent: Option<String>,
    pub agent_sd_unit: Option<String>,
}

/// Emit the new-deployment journal message. Uses `tracing::info!` with the
/// message id and the deployment's identifying fields so a log collector
/// can index on them the same way it would a direct `sd_journal_send` call.
pub fn log_new_deployment(fields: &DeploymentJournalFields) {
    info!(
        message_id = MESSAGE_ID_DEPLOYMENT,
        deployment_path = %fields.deployment_path,
        deployment_timestamp = fields.deployment_timestamp,
        deployment_device = fields.deployment_device,
        deployment_inode = fields.deployment_inode,
        deployment_checksum = %fields.deployment_checksum,
        deployment_refspec = fields.deployment_refspec.as_deref().unwrap_or(""),
        deployment_version = fields.deployment_version.as_deref().unwrap_or(""),
        command_line = fields.command_line.as_deref().unwrap_or(""),
        agent = fields.agent.as_deref().unwrap_or(""),
        agent_sd_unit = fields.agent_sd_unit.as_deref().unwrap_or(""),
        "created new deployment"
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn emitting_does_not_panic_without_a_subscriber() {
        log_new_deployment(&DeploymentJournalFields {
            deployment_path: "/ostree/deploy/fedora/deploy/abc.0".to_string(),
            deployment_timestamp: 1_700_000_000,
            deployment_device: 1,
            deployment_inode: 2,
            deployment_checksum: "abc".to_string(),
            deployment_refspec: Some("fedora:fedora/38/x86_64/silverblue".to_string()),
            deployment_version: None,
            command_line: Some("rpm-ostree upgrade".to_string()),
            agent: None,
            agent_sd_unit: None,
        });
    }
}
