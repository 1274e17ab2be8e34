pub mod app;
pub mod audit;
pub mod chat;
pub mod openai;
pub mod token;
