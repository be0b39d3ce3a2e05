use std::path::Path;

use {anyhow::bail, clap::Subcommand, tracing::warn};

use {
    wagate_config::{CredentialBackend, WagateConfig},
    wagate_whatsapp::{open_store, validate_session_id},
};

#[derive(Subcommand)]
pub enum CredentialAction {
    /// List session ids that have stored credentials.
    List,
    /// Delete the stored credentials of a session. Stop `wagate serve` first.
    Purge {
        /// Session id to purge.
        session_id: String,
    },
}

pub async fn handle_credentials(
    action: CredentialAction,
    config: &WagateConfig,
    data_dir: &Path,
) -> anyhow::Result<()> {
    if config.credentials.backend == CredentialBackend::Memory {
        warn!("memory credential backend keeps nothing between runs");
    }
    let store = open_store(&config.credentials, data_dir)?;

    match action {
        CredentialAction::List => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No stored credentials.");
            }
            for id in ids {
                println!("{id}");
            }
        },
        CredentialAction::Purge { session_id } => {
            validate_session_id(&session_id)?;
            if store.load(&session_id).await?.is_none() {
                bail!("no stored credentials for session {session_id}");
            }
            store.delete(&session_id).await?;
            println!("Purged credentials for {session_id}.");
        },
    }
    Ok(())
}
