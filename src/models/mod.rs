pub mod broadcast;
pub mod chat;
pub mod order;
pub mod tracking;
