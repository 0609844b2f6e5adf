pub mod db;
pub mod feed;

pub use db::PgChatStore;
pub use feed::PgChangeFeed;
