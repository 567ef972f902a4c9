//! [`MailMirror`] over IMAP.
//!
//! One connection per operation: connect, log in as the account through the
//! master-user suffix, act, log out. Connections are not pooled.

use super::{MailMirror, MirrorError};
use crate::config::MirrorConfig;
use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tokio_native_tls::native_tls;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

type ImapSession = Session<Compat<TlsStream<TcpStream>>>;

#[derive(Clone)]
pub struct ImapMirror {
    config: MirrorConfig,
}

impl ImapMirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, account: &str) -> Result<ImapSession, MirrorError> {
        let host = self.config.host.as_str();
        let tcp = TcpStream::connect((host, self.config.port)).await?;
        let tls = native_tls::TlsConnector::builder().build()?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let stream = tls.connect(host, tcp).await?;

        let client = async_imap::Client::new(stream.compat());
        let login = format!("{}{}", account, self.config.login_suffix);
        client
            .login(&login, &self.config.password)
            .await
            .map_err(|(source, _)| MirrorError::Login {
                account: account.to_string(),
                source,
            })
    }

    async fn finish(mut session: ImapSession) {
        if let Err(err) = session.logout().await {
            log::debug!("imap logout failed: {}", err);
        }
    }
}

async fn search_message_id(
    session: &mut ImapSession,
    mailbox: &str,
    message_id: &str,
) -> Result<Vec<u32>, MirrorError> {
    session.select(mailbox).await?;
    let query = format!("HEADER Message-ID \"{}\"", message_id.replace('"', ""));
    let mut uids: Vec<u32> = session.uid_search(&query).await?.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

#[async_trait]
impl MailMirror for ImapMirror {
    async fn append_if_absent(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
        raw: &[u8],
    ) -> Result<bool, MirrorError> {
        let mut session = self.connect(account).await?;
        let existing = search_message_id(&mut session, mailbox, message_id).await;
        let result = match existing {
            Ok(uids) if !uids.is_empty() => Ok(false),
            Ok(_) => session.append(mailbox, raw).await.map(|_| true).map_err(MirrorError::from),
            Err(err) => Err(err),
        };
        Self::finish(session).await;
        result
    }

    async fn move_message(&self, account: &str, source: &str, target: &str, uid: u32) -> Result<(), MirrorError> {
        let mut session = self.connect(account).await?;
        let result: Result<(), MirrorError> = async {
            session.select(source).await?;
            session.uid_mv(uid.to_string(), target).await?;
            Ok(())
        }
        .await;
        Self::finish(session).await;
        result
    }

    async fn set_seen(&self, account: &str, mailbox: &str, uid: u32, seen: bool) -> Result<(), MirrorError> {
        let mut session = self.connect(account).await?;
        let command = if seen { "+FLAGS (\\Seen)" } else { "-FLAGS (\\Seen)" };
        let result: Result<(), MirrorError> = async {
            session.select(mailbox).await?;
            let _updated: Vec<_> = session
                .uid_store(uid.to_string(), command)
                .await?
                .try_collect()
                .await?;
            Ok(())
        }
        .await;
        Self::finish(session).await;
        result
    }

    async fn find_by_message_id(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Vec<u32>, MirrorError> {
        let mut session = self.connect(account).await?;
        let result = search_message_id(&mut session, mailbox, message_id).await;
        Self::finish(session).await;
        result
    }
}
