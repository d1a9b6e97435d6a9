pub mod message;
pub mod payload;
