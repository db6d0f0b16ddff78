use uuid::Uuid;

/// Errors raised by admin operations, publish, and the dispatcher's
/// non-delivery-outcome failure paths.
///
/// Delivery outcomes themselves (non-2xx response, timeout, transport
/// failure) are never represented here — they are folded into the
/// delivery row's own state transitions instead.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("queue name {name:?} is not a valid identifier")]
    InvalidIdentifier { name: String },

    #[error("queue name {name:?} is already in use")]
    DuplicateQueueName { name: String },

    #[error("worker {worker_id} does not exist")]
    UnknownWorker { worker_id: Uuid },

    #[error("message id {message_id} is already in use")]
    DuplicateMessageId { message_id: Uuid },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
