pub mod attachment;
pub mod conntrack;
pub mod session;
pub mod tuple;

pub use attachment::{Attachments, CertAttachment, Value};
pub use conntrack::{ConntrackEntry, DirectionCounters, UpdateDelta};
pub use session::{ConntrackKind, Message, NetlogEvent, NfqueueResult, Plugin, Session, SubscriptionHandle};
pub use tuple::Tuple;
