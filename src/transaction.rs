use crate::client::{SessionRef, normalize_ack_headers};
use crate::config::SendOptions;
use crate::connection::TransactionHandle;
use crate::error::SessionError;
use crate::message::Message;
use crate::metrics::{Operation, destination_tags};

/// Transaction-scoped send/ack/nack. Nothing reaches a destination until
/// [`Transaction::commit`]; dropping an uncommitted transaction does not
/// abort it. Once its session is disconnected every operation fails with
/// [`SessionError::NotConnected`] and records nothing, like the session's own.
pub struct Transaction {
    handle: TransactionHandle,
    session: SessionRef,
}

impl Transaction {
    pub(crate) fn new(handle: TransactionHandle, session: SessionRef) -> Self {
        Self { handle, session }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: Option<&SendOptions>,
    ) -> Result<(), SessionError> {
        self.session.ensure_live()?;
        let tags = destination_tags(Some(destination));
        let body = body.into();
        self.session
            .track(Operation::Send, &tags, async {
                let opts = opts.cloned().unwrap_or_default();
                self.handle
                    .send(destination, content_type, body, &opts.header_pairs(), opts.receipt)
                    .await
            })
            .await
    }

    pub async fn ack(&self, message: Option<&mut Message>) -> Result<(), SessionError> {
        self.session.ensure_live()?;
        let message = message.ok_or(SessionError::NilMessage)?;
        normalize_ack_headers(message.frame_mut());
        let tags = destination_tags(message.destination());
        self.session
            .track(Operation::Ack, &tags, self.handle.ack(message.frame()))
            .await
    }

    pub async fn nack(&self, message: Option<&mut Message>) -> Result<(), SessionError> {
        self.session.ensure_live()?;
        let message = message.ok_or(SessionError::NilMessage)?;
        normalize_ack_headers(message.frame_mut());
        let tags = destination_tags(message.destination());
        self.session
            .track(Operation::Nack, &tags, self.handle.nack(message.frame()))
            .await
    }

    pub async fn commit(&self) -> Result<(), SessionError> {
        self.session.ensure_live()?;
        Ok(self.handle.commit().await?)
    }

    pub async fn abort(&self) -> Result<(), SessionError> {
        self.session.ensure_live()?;
        Ok(self.handle.abort().await?)
    }
}
