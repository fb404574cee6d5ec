pub mod channel_identity;
