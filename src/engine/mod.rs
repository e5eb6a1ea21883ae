pub mod chat;
pub mod consumers;
pub mod eta;
pub mod matcher;
pub mod orders;
pub mod tracker;
