//! STUN binding support: the message codec and the transaction engine

pub mod message;
pub mod request;

pub use message::{
    StunAttribute, StunError, StunMessage, StunMessageClass, StunMessageType, TransactionId,
    is_stun_message,
};
pub use request::{RequestHost, RequestOutcome, RetransmitConfig, StunRequestManager};
