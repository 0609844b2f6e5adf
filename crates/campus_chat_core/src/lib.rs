pub mod directory;
pub mod domain;
pub mod error;
pub mod feed;
pub mod memory;
pub mod messages;
pub mod ports;
pub mod read_state;
pub mod session;
pub mod view;

pub use directory::{ChatDirectory, RoomResolution};
pub use domain::{ChatMessage, ChatRoom, Identity, NewChatMessage, NewChatRoom, Role};
pub use error::{ChatError, ChatResult};
pub use feed::FeedHub;
pub use memory::MemoryChatStore;
pub use messages::{MessageService, SendOutcome};
pub use ports::{
    ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChatStore, PortError, PortResult, Row,
    Subscription, Table,
};
pub use read_state::ReadStateTracker;
pub use session::{BackoffPolicy, ChatServices, ChatSession, SessionSettings};
pub use view::{Notice, NoticeLevel, SubscriptionState, ViewState};
