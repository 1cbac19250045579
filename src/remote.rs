//! Interactive SSH channel to the analysis guest.
//!
//! Host key verification is skipped on purpose: the peer is an ephemeral
//! clone on an isolated network whose key was minted seconds ago, so there
//! is nothing to pin it against. The connection still authenticates us to
//! the guest with the template's public key.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("failed to read or parse private key: {0}")]
    Key(#[from] russh_keys::Error),
    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("SSH authentication was rejected")]
    AuthRejected,
    #[error("remote channel closed before the command exited")]
    ChannelClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct AcceptAllHost;

#[async_trait]
impl client::Handler for AcceptAllHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Reads and parses the PEM private key used to authenticate against guests.
pub fn load_key(path: &str) -> Result<Arc<key::KeyPair>, RemoteError> {
    Ok(Arc::new(russh_keys::load_secret_key(path, None)?))
}

/// Authenticated SSH session with one guest.
pub struct RemoteSession {
    handle: client::Handle<AcceptAllHost>,
}

impl RemoteSession {
    /// Dials `host:22` and authenticates with the given key.
    pub async fn dial(host: &str, user: &str, key: Arc<key::KeyPair>) -> Result<Self, RemoteError> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (host, 22), AcceptAllHost).await?;
        if !handle.authenticate_publickey(user, key).await? {
            return Err(RemoteError::AuthRejected);
        }
        Ok(RemoteSession { handle })
    }

    /// Streams a local file to the guest.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<u64, RemoteError> {
        let sftp = self.sftp().await?;
        let mut src = tokio::fs::File::open(local).await?;
        let mut dst = sftp.create(remote).await?;
        let copied = tokio::io::copy(&mut src, &mut dst).await?;
        dst.shutdown().await?;
        Ok(copied)
    }

    /// Streams a remote file into a local one. A zero-byte remote file
    /// produces a zero-byte local file; a missing remote file is an error.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<u64, RemoteError> {
        let sftp = self.sftp().await?;
        let mut src = sftp.open(remote).await?;
        let mut dst = tokio::fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut src, &mut dst).await?;
        dst.flush().await?;
        Ok(copied)
    }

    /// Starts a shell command on a fresh session channel.
    pub async fn start(&self, command: &str) -> Result<RemoteCommand, RemoteError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(RemoteCommand { channel })
    }

    async fn sftp(&self) -> Result<SftpSession, RemoteError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        Ok(SftpSession::new(channel.into_stream()).await?)
    }

    /// Releases the connection. Errors here are of no interest: the VM is
    /// about to be destroyed anyway.
    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "analysis finished", "en")
            .await;
    }
}

/// A command executing on the guest.
pub struct RemoteCommand {
    channel: Channel<Msg>,
}

impl RemoteCommand {
    /// Blocks until the remote process exits and returns its exit status.
    pub async fn wait(&mut self) -> Result<u32, RemoteError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => return Ok(exit_status),
                Some(_) => continue,
                None => return Err(RemoteError::ChannelClosed),
            }
        }
    }

    /// Forcibly terminates the remote process.
    pub async fn kill(&mut self) -> Result<(), RemoteError> {
        self.channel.signal(Sig::KILL).await?;
        Ok(())
    }
}
