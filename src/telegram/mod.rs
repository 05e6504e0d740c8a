pub mod handler;
pub mod keyboards;
pub mod transport;
pub mod types;
pub mod utils;

pub use handler::TelegramService;
