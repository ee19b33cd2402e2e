//! Core data model shared by the store, bus and orchestration layers.

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// variants map one-to-one onto the strings persisted in the store.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$($name::$variant,)+]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::Error::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

pub mod agent;
pub mod merge;
pub mod message;
pub mod records;
pub mod task;

pub use agent::{AgentId, AgentInstance, AgentStatus, AgentType};
pub use merge::{MergeQueueEntry, MergeState, MergeStrategy};
pub use message::{Message, MessageId, MessageStatus, NewMessage, Recipient};
pub use records::{
    Alert, AlertLevel, BugRecord, CrashRecord, ErrorType, HealthCheck, HealthStatus,
};
pub use task::{NewTask, Task, TaskId, TaskKind, TaskStatus};
