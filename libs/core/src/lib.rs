//! Core domain types for Gramflow: automation rules, normalized Instagram
//! events, the coded error type, and the Graph API client used by both the
//! webhook ingress and the dashboard API.

mod automation;
mod error;
mod events;
pub mod instagram;
mod stores;

pub use automation::{Automation, FollowGate, LinkButton, ReplyTemplate};
pub use error::{CoreError, CoreResult};
pub use events::{now_rfc3339, CommentEvent, DmEvent};
pub use instagram::{
    CommentPage, FetchedComment, GraphClient, InstagramApi, InstagramCredentials, SendReceipt,
};
pub use stores::{
    AutomationStore, CredentialResolver, DeadLetterRecord, DeadLetterSink, DeliveryRecord,
    DeliveryState, DeliveryStore,
};

pub mod prelude {
    pub use crate::{
        Automation, CommentEvent, CoreError, CoreResult, DmEvent, FollowGate, InstagramApi,
        InstagramCredentials, ReplyTemplate,
    };
}
