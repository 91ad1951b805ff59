pub mod chat;
pub mod conversations;
pub mod cursor;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod notify;
pub mod router;
pub mod state;
pub mod users;
