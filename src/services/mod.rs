pub mod channel;
pub mod credentials;
pub mod error;
pub mod images;
pub mod publish;
pub mod synchronizer;
pub mod webhook;
